use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::offer::{AssignmentOffer, OfferOutcome};
use crate::models::order::{ActiveOrder, DeliveryStage, OrderClearReason};
use crate::models::presence::{DriverPresence, PresenceHealth, PresenceStatus};

/// Events pushed by the dispatch server to a driver's connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    OfferReceived(AssignmentOffer),
    OfferExpired {
        assignment_id: Uuid,
        order_id: Uuid,
    },
    OfferAccepted {
        assignment_id: Uuid,
        order_id: Uuid,
        driver_id: Uuid,
    },
    OfferCancelled {
        assignment_id: Uuid,
        order_id: Uuid,
        reason: Option<String>,
    },
    DriverStatusUpdated {
        driver_id: Uuid,
        status: PresenceStatus,
        is_online: bool,
    },
    OrderUpdated(ActiveOrder),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InboundKind {
    OfferReceived,
    OfferExpired,
    OfferAccepted,
    OfferCancelled,
    DriverStatusUpdated,
    OrderUpdated,
}

impl InboundKind {
    pub const ALL: [InboundKind; 6] = [
        InboundKind::OfferReceived,
        InboundKind::OfferExpired,
        InboundKind::OfferAccepted,
        InboundKind::OfferCancelled,
        InboundKind::DriverStatusUpdated,
        InboundKind::OrderUpdated,
    ];
}

impl InboundEvent {
    pub fn kind(&self) -> InboundKind {
        match self {
            InboundEvent::OfferReceived(_) => InboundKind::OfferReceived,
            InboundEvent::OfferExpired { .. } => InboundKind::OfferExpired,
            InboundEvent::OfferAccepted { .. } => InboundKind::OfferAccepted,
            InboundEvent::OfferCancelled { .. } => InboundKind::OfferCancelled,
            InboundEvent::DriverStatusUpdated { .. } => InboundKind::DriverStatusUpdated,
            InboundEvent::OrderUpdated(_) => InboundKind::OrderUpdated,
        }
    }
}

/// Events a driver client sends to the dispatch server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    DriverLocationUpdate {
        lat: f64,
        lng: f64,
        timestamp: DateTime<Utc>,
    },
    DriverStatusUpdate {
        status: PresenceStatus,
        timestamp: DateTime<Utc>,
    },
    DriverHeartbeat {
        driver_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    JoinDriverRoom {
        driver_id: Uuid,
    },
    LeaveDriverRoom {
        driver_id: Uuid,
    },
}

/// Connection lifecycle notifications from a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Reconnected,
    GaveUp,
}

/// Change notifications published by a driver session to its observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    PresenceChanged {
        presence: DriverPresence,
    },
    HealthChanged {
        health: PresenceHealth,
    },
    OfferPresented {
        offer: AssignmentOffer,
        seconds_remaining: Option<u64>,
    },
    OfferResolved {
        assignment_id: Uuid,
        order_id: Uuid,
        outcome: OfferOutcome,
    },
    OrderUpdated {
        order: ActiveOrder,
        stage: DeliveryStage,
    },
    StageAnomaly {
        order_id: Uuid,
        previous: DeliveryStage,
        derived: DeliveryStage,
    },
    OrderCleared {
        order_id: Uuid,
        reason: OrderClearReason,
    },
    ConnectionChanged {
        connected: bool,
    },
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::{InboundEvent, InboundKind, OutboundEvent};
    use crate::models::presence::PresenceStatus;

    #[test]
    fn inbound_cancel_parses_from_wire_frame() {
        let assignment_id = Uuid::from_u128(7);
        let order_id = Uuid::from_u128(9);
        let frame = json!({
            "event": "offer_cancelled",
            "data": {
                "assignment_id": assignment_id,
                "order_id": order_id,
                "reason": "customer_cancelled"
            }
        });

        let event: InboundEvent = serde_json::from_value(frame).unwrap();
        assert_eq!(event.kind(), InboundKind::OfferCancelled);
        assert_eq!(
            event,
            InboundEvent::OfferCancelled {
                assignment_id,
                order_id,
                reason: Some("customer_cancelled".to_string()),
            }
        );
    }

    #[test]
    fn outbound_status_update_uses_event_envelope() {
        let event = OutboundEvent::DriverStatusUpdate {
            status: PresenceStatus::Busy,
            timestamp: chrono::Utc::now(),
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "driver_status_update");
        assert_eq!(value["data"]["status"], "BUSY");
    }
}
