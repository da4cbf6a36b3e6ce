use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::offer::OfferSnapshot;

/// Coarse order status owned by the backend. The restaurant side may advance
/// it independently of the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OrderStatus {
    Pending,
    Preparing,
    Ready,
    PickedUp,
    Delivering,
    Delivered,
    Cancelled,
    Other(String),
}

impl OrderStatus {
    pub fn as_str(&self) -> &str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Preparing => "PREPARING",
            OrderStatus::Ready => "READY",
            OrderStatus::PickedUp => "PICKED_UP",
            OrderStatus::Delivering => "DELIVERING",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Other(raw) => raw,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }
}

impl From<String> for OrderStatus {
    fn from(raw: String) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "PENDING" => OrderStatus::Pending,
            // the restaurant accepting the order means the kitchen is on it
            "PREPARING" | "ACCEPTED" | "CONFIRMED" => OrderStatus::Preparing,
            "READY" => OrderStatus::Ready,
            "PICKED_UP" => OrderStatus::PickedUp,
            "DELIVERING" => OrderStatus::Delivering,
            "DELIVERED" => OrderStatus::Delivered,
            "CANCELLED" | "CANCELED" => OrderStatus::Cancelled,
            _ => OrderStatus::Other(raw),
        }
    }
}

impl From<OrderStatus> for String {
    fn from(status: OrderStatus) -> Self {
        status.as_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveOrder {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub driver_assigned_at: Option<DateTime<Utc>>,
    pub arrived_at_restaurant_at: Option<DateTime<Utc>>,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub snapshot: Option<OfferSnapshot>,
    pub updated_at: DateTime<Utc>,
}

/// Driver-facing step of a delivery, derived from [`OrderStatus`] plus
/// timestamp markers. Declaration order is pipeline order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStage {
    Assigned,
    EnRouteToRestaurant,
    WaitingAtRestaurant,
    PickedUp,
    EnRouteToCustomer,
    Delivered,
}

impl DeliveryStage {
    pub fn as_label(self) -> &'static str {
        match self {
            DeliveryStage::Assigned => "assigned",
            DeliveryStage::EnRouteToRestaurant => "en_route_to_restaurant",
            DeliveryStage::WaitingAtRestaurant => "waiting_at_restaurant",
            DeliveryStage::PickedUp => "picked_up",
            DeliveryStage::EnRouteToCustomer => "en_route_to_customer",
            DeliveryStage::Delivered => "delivered",
        }
    }

    pub fn is_before_pickup(self) -> bool {
        self < DeliveryStage::PickedUp
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DriverAction {
    StartNavigation,
    ArriveAtRestaurant,
    PickUp,
    StartDelivery,
    CompleteDelivery,
    Cancel,
}

impl DriverAction {
    pub fn as_str(self) -> &'static str {
        match self {
            DriverAction::StartNavigation => "start_navigation",
            DriverAction::ArriveAtRestaurant => "arrive_at_restaurant",
            DriverAction::PickUp => "pick_up",
            DriverAction::StartDelivery => "start_delivery",
            DriverAction::CompleteDelivery => "complete_delivery",
            DriverAction::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeliveryProof {
    pub photo_ref: Option<String>,
    pub recipient_name: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancellationReason {
    RestaurantClosed,
    OrderNotReady,
    VehicleBreakdown,
    PersonalEmergency,
    Other,
}

impl CancellationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancellationReason::RestaurantClosed => "restaurant_closed",
            CancellationReason::OrderNotReady => "order_not_ready",
            CancellationReason::VehicleBreakdown => "vehicle_breakdown",
            CancellationReason::PersonalEmergency => "personal_emergency",
            CancellationReason::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderClearReason {
    Delivered,
    Cancelled,
    RemovedRemotely,
}

/// Active order plus the stage the driver UI should render for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackedOrder {
    pub order: ActiveOrder,
    pub stage: DeliveryStage,
    pub action_in_flight: Option<DriverAction>,
}

/// A finished order kept for the session's history screen.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderHistoryEntry {
    pub order: ActiveOrder,
    pub reason: OrderClearReason,
    pub finished_at: DateTime<Utc>,
}
