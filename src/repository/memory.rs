use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::offer::{AssignmentOffer, DeclineReason, OfferSnapshot};
use crate::models::order::{ActiveOrder, CancellationReason, DeliveryProof, DriverAction, OrderStatus};
use crate::models::presence::{GeoPoint, PresenceStatus};
use crate::repository::OrderRepository;

#[derive(Debug, Clone)]
struct BackendOrder {
    order: ActiveOrder,
    driver_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
struct AssignmentRecord {
    order_id: Uuid,
    driver_id: Uuid,
    withdrawn: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriverRecord {
    pub status: PresenceStatus,
    pub location: Option<GeoPoint>,
    pub heartbeats: u64,
}

/// In-process dispatch backend. Claims are decided atomically per order, so
/// concurrent accepts from different drivers resolve to exactly one winner.
#[derive(Default)]
pub struct InMemoryOrderRepository {
    orders: DashMap<Uuid, BackendOrder>,
    assignments: DashMap<Uuid, AssignmentRecord>,
    drivers: DashMap<Uuid, DriverRecord>,
    fail_next: AtomicU32,
    latency_ms: AtomicU64,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_order(&self, snapshot: OfferSnapshot) -> Uuid {
        let order_id = Uuid::new_v4();
        let order = ActiveOrder {
            order_id,
            status: OrderStatus::Pending,
            driver_assigned_at: None,
            arrived_at_restaurant_at: None,
            picked_up_at: None,
            delivered_at: None,
            snapshot: Some(snapshot),
            updated_at: Utc::now(),
        };
        self.orders.insert(
            order_id,
            BackendOrder {
                order,
                driver_id: None,
            },
        );
        order_id
    }

    /// Registers an offer of `order_id` to `driver_id` and returns what the
    /// realtime server would push to that driver.
    pub fn publish_offer(
        &self,
        driver_id: Uuid,
        order_id: Uuid,
        wave: u32,
        ttl: Option<Duration>,
    ) -> Result<AssignmentOffer, AppError> {
        let snapshot = self
            .orders
            .get(&order_id)
            .and_then(|entry| entry.order.snapshot.clone())
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;

        let assignment_id = Uuid::new_v4();
        self.assignments.insert(
            assignment_id,
            AssignmentRecord {
                order_id,
                driver_id,
                withdrawn: false,
            },
        );

        let expires_at = match ttl {
            Some(ttl) => Some(
                Utc::now()
                    + chrono::Duration::from_std(ttl)
                        .map_err(|err| AppError::BadRequest(format!("invalid ttl: {err}")))?,
            ),
            None => None,
        };

        Ok(AssignmentOffer {
            assignment_id,
            order_id,
            expires_at,
            wave: wave.max(1),
            snapshot,
        })
    }

    pub fn withdraw_offer(&self, assignment_id: Uuid) {
        if let Some(mut record) = self.assignments.get_mut(&assignment_id) {
            record.withdrawn = true;
        }
    }

    /// Restaurant-side status change, independent of the driver.
    pub fn set_status(&self, order_id: Uuid, status: OrderStatus) -> Option<ActiveOrder> {
        let mut entry = self.orders.get_mut(&order_id)?;
        entry.order.status = status;
        entry.order.updated_at = Utc::now();
        Some(entry.order.clone())
    }

    pub fn order(&self, order_id: Uuid) -> Option<ActiveOrder> {
        self.orders.get(&order_id).map(|entry| entry.order.clone())
    }

    pub fn assigned_driver(&self, order_id: Uuid) -> Option<Uuid> {
        self.orders.get(&order_id).and_then(|entry| entry.driver_id)
    }

    pub fn driver(&self, driver_id: Uuid) -> Option<DriverRecord> {
        self.drivers.get(&driver_id).map(|entry| entry.clone())
    }

    /// The next `count` calls fail with a network error.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn simulate_network(&self, call: &str) -> Result<(), AppError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return Err(AppError::Network(format!("{call}: connection reset")));
        }
        Ok(())
    }

    fn update_order<F>(&self, order_id: Uuid, action: DriverAction, apply: F) -> Result<ActiveOrder, AppError>
    where
        F: FnOnce(&mut ActiveOrder) -> Result<(), String>,
    {
        let mut entry = self
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;

        if entry.driver_id.is_none() {
            return Err(AppError::stage_blocked(None, action, "order has no driver"));
        }

        apply(&mut entry.order).map_err(|reason| AppError::stage_blocked(None, action, reason))?;
        entry.order.updated_at = Utc::now();
        Ok(entry.order.clone())
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn accept_assignment_offer(&self, assignment_id: Uuid) -> Result<ActiveOrder, AppError> {
        self.simulate_network("accept_assignment_offer").await?;

        let record = self
            .assignments
            .get(&assignment_id)
            .map(|entry| entry.clone())
            .ok_or(AppError::AssignmentUnavailable { assignment_id })?;

        if record.withdrawn {
            return Err(AppError::AssignmentUnavailable { assignment_id });
        }

        // the per-order shard lock makes claim-and-assign atomic
        let mut entry = self
            .orders
            .get_mut(&record.order_id)
            .ok_or(AppError::AssignmentUnavailable { assignment_id })?;

        match entry.driver_id {
            Some(owner) if owner != record.driver_id => {
                return Err(AppError::AssignmentUnavailable { assignment_id });
            }
            Some(_) => return Ok(entry.order.clone()),
            None => {}
        }

        if entry.order.status.is_finished() {
            return Err(AppError::AssignmentUnavailable { assignment_id });
        }

        let now = Utc::now();
        entry.driver_id = Some(record.driver_id);
        entry.order.driver_assigned_at = Some(now);
        if entry.order.status == OrderStatus::Pending {
            entry.order.status = OrderStatus::Preparing;
        }
        entry.order.updated_at = now;

        info!(
            assignment_id = %assignment_id,
            order_id = %record.order_id,
            driver_id = %record.driver_id,
            "order claimed"
        );

        Ok(entry.order.clone())
    }

    async fn decline_assignment_offer(
        &self,
        assignment_id: Uuid,
        _reason: DeclineReason,
    ) -> Result<(), AppError> {
        self.simulate_network("decline_assignment_offer").await?;
        self.withdraw_offer(assignment_id);
        Ok(())
    }

    async fn arrive_at_restaurant(&self, order_id: Uuid) -> Result<ActiveOrder, AppError> {
        self.simulate_network("arrive_at_restaurant").await?;
        self.update_order(order_id, DriverAction::ArriveAtRestaurant, |order| {
            match order.status {
                OrderStatus::Preparing | OrderStatus::Ready => {
                    order.arrived_at_restaurant_at.get_or_insert_with(Utc::now);
                    Ok(())
                }
                ref other => Err(format!("cannot arrive while {}", other.as_str())),
            }
        })
    }

    async fn pickup_order(&self, order_id: Uuid) -> Result<ActiveOrder, AppError> {
        self.simulate_network("pickup_order").await?;
        self.update_order(order_id, DriverAction::PickUp, |order| {
            if order.status != OrderStatus::Ready {
                return Err(format!("order is {}, not READY", order.status.as_str()));
            }
            order.status = OrderStatus::PickedUp;
            order.picked_up_at = Some(Utc::now());
            Ok(())
        })
    }

    async fn start_delivery(&self, order_id: Uuid) -> Result<ActiveOrder, AppError> {
        self.simulate_network("start_delivery").await?;
        self.update_order(order_id, DriverAction::StartDelivery, |order| {
            if order.status != OrderStatus::PickedUp {
                return Err(format!("order is {}, not PICKED_UP", order.status.as_str()));
            }
            order.status = OrderStatus::Delivering;
            Ok(())
        })
    }

    async fn complete_delivery(
        &self,
        order_id: Uuid,
        _proof: Option<DeliveryProof>,
    ) -> Result<ActiveOrder, AppError> {
        self.simulate_network("complete_delivery").await?;
        self.update_order(order_id, DriverAction::CompleteDelivery, |order| {
            if order.status != OrderStatus::Delivering {
                return Err(format!("order is {}, not DELIVERING", order.status.as_str()));
            }
            order.status = OrderStatus::Delivered;
            order.delivered_at = Some(Utc::now());
            Ok(())
        })
    }

    async fn cancel_order(
        &self,
        order_id: Uuid,
        _reason: CancellationReason,
    ) -> Result<(), AppError> {
        self.simulate_network("cancel_order").await?;
        self.update_order(order_id, DriverAction::Cancel, |order| match order.status {
            OrderStatus::Preparing | OrderStatus::Ready => {
                order.status = OrderStatus::Cancelled;
                Ok(())
            }
            ref other => Err(format!("cannot cancel while {}", other.as_str())),
        })?;
        Ok(())
    }

    async fn update_driver_state(
        &self,
        driver_id: Uuid,
        status: PresenceStatus,
        location: Option<GeoPoint>,
    ) -> Result<(), AppError> {
        self.simulate_network("update_driver_state").await?;
        let mut record = self.drivers.entry(driver_id).or_insert(DriverRecord {
            status,
            location: None,
            heartbeats: 0,
        });
        record.status = status;
        if location.is_some() {
            record.location = location;
        }
        Ok(())
    }

    async fn send_heartbeat(
        &self,
        driver_id: Uuid,
        location: Option<GeoPoint>,
    ) -> Result<(), AppError> {
        self.simulate_network("send_heartbeat").await?;
        let mut record = self
            .drivers
            .get_mut(&driver_id)
            .ok_or_else(|| AppError::NotFound(format!("driver {driver_id} not registered")))?;
        record.heartbeats += 1;
        if location.is_some() {
            record.location = location;
        }
        Ok(())
    }

    async fn fetch_active_order(&self, driver_id: Uuid) -> Result<Option<ActiveOrder>, AppError> {
        self.simulate_network("fetch_active_order").await?;
        Ok(self
            .orders
            .iter()
            .find(|entry| entry.driver_id == Some(driver_id) && !entry.order.status.is_finished())
            .map(|entry| entry.order.clone()))
    }
}
