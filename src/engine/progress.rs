//! Delivery pipeline for the driver's active order.
//!
//! The backend owns the coarse [`OrderStatus`]; the driver-facing
//! [`DeliveryStage`] is re-derived from it on every update, whether pushed,
//! polled or returned by a driver action. The only stage the backend never
//! sees is EN_ROUTE_TO_RESTAURANT, which is kept locally.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::notify::Notifier;
use crate::error::AppError;
use crate::geo;
use crate::models::events::SessionEvent;
use crate::models::order::{
    ActiveOrder, CancellationReason, DeliveryProof, DeliveryStage, DriverAction, OrderClearReason,
    OrderHistoryEntry, OrderStatus, TrackedOrder,
};
use crate::models::presence::GeoPoint;
use crate::observability::metrics::Metrics;
use crate::repository::{OrderRepository, bounded};

/// Stage from status plus the arrival marker. Pickup and delivery markers
/// never change the outcome: the status already reflects them.
pub fn derive_stage(order: &ActiveOrder) -> DeliveryStage {
    match order.status {
        OrderStatus::Delivered => DeliveryStage::Delivered,
        OrderStatus::Delivering => DeliveryStage::EnRouteToCustomer,
        OrderStatus::PickedUp => DeliveryStage::PickedUp,
        OrderStatus::Preparing | OrderStatus::Ready => {
            if order.arrived_at_restaurant_at.is_some() {
                DeliveryStage::WaitingAtRestaurant
            } else {
                DeliveryStage::Assigned
            }
        }
        _ => DeliveryStage::Assigned,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    pub stage: DeliveryStage,
    pub anomaly: bool,
}

/// Merges a freshly derived stage with what the driver saw before.
pub fn reconcile_stage(previous: Option<DeliveryStage>, derived: DeliveryStage) -> Reconciled {
    match previous {
        Some(DeliveryStage::EnRouteToRestaurant) if derived == DeliveryStage::Assigned => {
            Reconciled {
                stage: DeliveryStage::EnRouteToRestaurant,
                anomaly: false,
            }
        }
        Some(previous) if derived < previous => Reconciled {
            stage: derived,
            anomaly: true,
        },
        _ => Reconciled {
            stage: derived,
            anomaly: false,
        },
    }
}

pub fn can_cancel(status: &OrderStatus) -> bool {
    matches!(status, OrderStatus::Preparing | OrderStatus::Ready)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Stage changes without asking the backend.
    Local(DeliveryStage),
    /// The backend decides; the next stage is derived from its response.
    Remote,
}

/// Which driver actions are allowed from which stage.
pub fn plan(
    stage: DeliveryStage,
    status: &OrderStatus,
    action: DriverAction,
) -> Result<Step, AppError> {
    let blocked = |reason: &str| -> Result<Step, AppError> {
        Err(AppError::stage_blocked(Some(stage), action, reason))
    };

    match (action, stage) {
        (DriverAction::StartNavigation, DeliveryStage::Assigned) => {
            Ok(Step::Local(DeliveryStage::EnRouteToRestaurant))
        }
        (DriverAction::ArriveAtRestaurant, DeliveryStage::EnRouteToRestaurant) => Ok(Step::Remote),
        (DriverAction::PickUp, DeliveryStage::WaitingAtRestaurant) => {
            if *status == OrderStatus::Ready {
                Ok(Step::Remote)
            } else {
                blocked("restaurant has not marked the order ready")
            }
        }
        (DriverAction::StartDelivery, DeliveryStage::PickedUp) => Ok(Step::Remote),
        (DriverAction::CompleteDelivery, DeliveryStage::EnRouteToCustomer) => Ok(Step::Remote),
        (DriverAction::Cancel, _) => {
            if can_cancel(status) && stage.is_before_pickup() {
                Ok(Step::Remote)
            } else {
                blocked("only orders not yet picked up can be cancelled")
            }
        }
        _ => blocked("not the next step of the delivery"),
    }
}

const FINISHED_LEDGER: usize = 64;

#[derive(Default)]
struct ProgressBook {
    current: Option<TrackedOrder>,
    history: VecDeque<OrderHistoryEntry>,
    /// Ids of orders cleared this session, independent of the history limit.
    finished: VecDeque<Uuid>,
}

#[derive(Clone)]
pub struct OrderProgress {
    inner: Arc<ProgressInner>,
}

struct ProgressInner {
    driver_id: Uuid,
    book: Mutex<ProgressBook>,
    repository: Arc<dyn OrderRepository>,
    notifier: Notifier,
    metrics: Arc<Metrics>,
    request_timeout: Duration,
    history_limit: usize,
}

impl OrderProgress {
    pub fn new(
        driver_id: Uuid,
        repository: Arc<dyn OrderRepository>,
        notifier: Notifier,
        metrics: Arc<Metrics>,
        request_timeout: Duration,
        history_limit: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ProgressInner {
                driver_id,
                book: Mutex::new(ProgressBook::default()),
                repository,
                notifier,
                metrics,
                request_timeout,
                history_limit,
            }),
        }
    }

    pub fn current(&self) -> Option<TrackedOrder> {
        self.inner.lock().current.clone()
    }

    pub fn stage(&self) -> Option<DeliveryStage> {
        self.inner.lock().current.as_ref().map(|tracked| tracked.stage)
    }

    pub fn has_active_order(&self) -> bool {
        self.inner.lock().current.is_some()
    }

    pub fn history(&self) -> Vec<OrderHistoryEntry> {
        self.inner.lock().history.iter().rev().cloned().collect()
    }

    /// Starts tracking the order returned by a successful accept.
    pub fn adopt(&self, order: ActiveOrder) -> TrackedOrder {
        let mut book = self.inner.lock();
        if let Some(previous) = book
            .current
            .as_ref()
            .filter(|tracked| tracked.order.order_id != order.order_id)
        {
            warn!(
                driver_id = %self.inner.driver_id,
                replaced = %previous.order.order_id,
                order_id = %order.order_id,
                "accepted order replaces a tracked one"
            );
            let previous = previous.order.clone();
            self.inner
                .clear(&mut book, previous, OrderClearReason::RemovedRemotely);
        }
        self.inner.integrate(&mut book, order)
    }

    /// Pushed `order_updated` events. Updates for other orders, updates older
    /// than what is tracked and late pushes for an order already cleared are
    /// dropped; only `refresh` or an accept can bring a cleared order back.
    pub fn apply_update(&self, order: ActiveOrder) -> Option<TrackedOrder> {
        let mut book = self.inner.lock();
        match &book.current {
            Some(tracked) if tracked.order.order_id != order.order_id => {
                debug!(order_id = %order.order_id, "update for an untracked order ignored");
                return None;
            }
            Some(tracked) if order.updated_at < tracked.order.updated_at => {
                debug!(order_id = %order.order_id, "out of date order update ignored");
                return None;
            }
            None if order.status.is_finished() => return None,
            None if book.finished.contains(&order.order_id) => {
                debug!(order_id = %order.order_id, "update for a cleared order ignored");
                return None;
            }
            _ => {}
        }
        Some(self.inner.integrate(&mut book, order))
    }

    /// Re-reads the active order from the backend. Skipped while a driver
    /// action is in flight; its response is the fresher source.
    pub async fn refresh(&self) -> Result<Option<TrackedOrder>, AppError> {
        let inner = &self.inner;
        if inner
            .lock()
            .current
            .as_ref()
            .is_some_and(|tracked| tracked.action_in_flight.is_some())
        {
            return Ok(self.current());
        }

        let fetched = bounded(
            inner.request_timeout,
            "fetch_active_order",
            inner.repository.fetch_active_order(inner.driver_id),
        )
        .await?;

        let mut book = inner.lock();
        if book
            .current
            .as_ref()
            .is_some_and(|tracked| tracked.action_in_flight.is_some())
        {
            return Ok(book.current.clone());
        }

        let stale = book.current.as_ref().and_then(|tracked| match &fetched {
            Some(order) if order.order_id == tracked.order.order_id => None,
            _ => Some(tracked.order.clone()),
        });
        if let Some(stale) = stale {
            info!(
                driver_id = %inner.driver_id,
                order_id = %stale.order_id,
                "backend no longer lists the tracked order"
            );
            inner.clear(&mut book, stale, OrderClearReason::RemovedRemotely);
        }

        Ok(fetched.map(|order| inner.integrate(&mut book, order)))
    }

    pub fn start_navigation(&self) -> Result<TrackedOrder, AppError> {
        let mut book = self.inner.lock();
        let tracked = book
            .current
            .as_mut()
            .ok_or_else(|| no_active_order(DriverAction::StartNavigation))?;
        if tracked.action_in_flight.is_some() {
            return Err(in_flight(tracked, DriverAction::StartNavigation));
        }

        match plan(
            tracked.stage,
            &tracked.order.status,
            DriverAction::StartNavigation,
        )? {
            Step::Local(next) => {
                tracked.stage = next;
                let tracked = tracked.clone();
                self.inner.stage_entered(&tracked);
                Ok(tracked)
            }
            Step::Remote => Err(AppError::Internal(
                "navigation has no backend call".to_string(),
            )),
        }
    }

    pub async fn arrive(&self) -> Result<TrackedOrder, AppError> {
        let order_id = self.inner.begin(DriverAction::ArriveAtRestaurant)?;
        let result = bounded(
            self.inner.request_timeout,
            "arrive_at_restaurant",
            self.inner.repository.arrive_at_restaurant(order_id),
        )
        .await;
        self.inner.finish(order_id, result)
    }

    /// The backend re-validates READY; a rejection there surfaces as
    /// [`AppError::InvalidStageTransition`] too.
    pub async fn pickup(&self) -> Result<TrackedOrder, AppError> {
        let order_id = self.inner.begin(DriverAction::PickUp)?;
        let result = bounded(
            self.inner.request_timeout,
            "pickup_order",
            self.inner.repository.pickup_order(order_id),
        )
        .await;
        self.inner.finish(order_id, result)
    }

    pub async fn start_delivery(&self) -> Result<TrackedOrder, AppError> {
        let order_id = self.inner.begin(DriverAction::StartDelivery)?;
        let result = bounded(
            self.inner.request_timeout,
            "start_delivery",
            self.inner.repository.start_delivery(order_id),
        )
        .await;
        self.inner.finish(order_id, result)
    }

    pub async fn complete_delivery(
        &self,
        proof: Option<DeliveryProof>,
    ) -> Result<TrackedOrder, AppError> {
        let order_id = self.inner.begin(DriverAction::CompleteDelivery)?;
        let result = bounded(
            self.inner.request_timeout,
            "complete_delivery",
            self.inner.repository.complete_delivery(order_id, proof),
        )
        .await;
        self.inner.finish(order_id, result)
    }

    pub async fn cancel(&self, reason: CancellationReason) -> Result<ActiveOrder, AppError> {
        let inner = &self.inner;
        let order_id = inner.begin(DriverAction::Cancel)?;
        let result = bounded(
            inner.request_timeout,
            "cancel_order",
            inner.repository.cancel_order(order_id, reason.clone()),
        )
        .await;

        let mut book = inner.lock();
        let tracked = inner.release(&mut book, order_id);
        result?;

        let mut order = tracked
            .map(|tracked| tracked.order)
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} no longer tracked")))?;
        order.status = OrderStatus::Cancelled;
        order.updated_at = Utc::now();

        info!(
            driver_id = %inner.driver_id,
            order_id = %order_id,
            reason = reason.as_str(),
            "order cancelled by driver"
        );
        inner.clear(&mut book, order.clone(), OrderClearReason::Cancelled);
        Ok(order)
    }

    /// Straight-line distance to the next stop: the restaurant before pickup,
    /// the customer after.
    pub fn next_stop_distance_km(&self, from: GeoPoint) -> Option<f64> {
        let book = self.inner.lock();
        let tracked = book.current.as_ref()?;
        let snapshot = tracked.order.snapshot.as_ref()?;
        let stop = if tracked.stage.is_before_pickup() {
            &snapshot.restaurant
        } else {
            &snapshot.customer
        };
        stop.location
            .as_ref()
            .map(|location| geo::haversine_km(&from, location))
    }
}

fn no_active_order(action: DriverAction) -> AppError {
    AppError::stage_blocked(None, action, "no active order")
}

fn in_flight(tracked: &TrackedOrder, action: DriverAction) -> AppError {
    let running = tracked
        .action_in_flight
        .map(DriverAction::as_str)
        .unwrap_or_default();
    AppError::stage_blocked(
        Some(tracked.stage),
        action,
        format!("{running} is still in flight"),
    )
}

impl ProgressInner {
    fn lock(&self) -> MutexGuard<'_, ProgressBook> {
        self.book
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Checks the transition table and marks the action in flight.
    fn begin(&self, action: DriverAction) -> Result<Uuid, AppError> {
        let mut book = self.lock();
        let tracked = book
            .current
            .as_mut()
            .ok_or_else(|| no_active_order(action))?;
        if tracked.action_in_flight.is_some() {
            return Err(in_flight(tracked, action));
        }

        plan(tracked.stage, &tracked.order.status, action)?;
        tracked.action_in_flight = Some(action);
        debug!(
            driver_id = %self.driver_id,
            order_id = %tracked.order.order_id,
            action = action.as_str(),
            "driver action started"
        );
        Ok(tracked.order.order_id)
    }

    fn release(&self, book: &mut ProgressBook, order_id: Uuid) -> Option<TrackedOrder> {
        let tracked = book
            .current
            .as_mut()
            .filter(|tracked| tracked.order.order_id == order_id)?;
        tracked.action_in_flight = None;
        Some(tracked.clone())
    }

    fn finish(
        &self,
        order_id: Uuid,
        result: Result<ActiveOrder, AppError>,
    ) -> Result<TrackedOrder, AppError> {
        let mut book = self.lock();
        let tracked = self.release(&mut book, order_id);
        let order = result?;

        if tracked.is_none() {
            // cleared while the call was in flight; report without tracking
            let stage = derive_stage(&order);
            return Ok(TrackedOrder {
                order,
                stage,
                action_in_flight: None,
            });
        }
        Ok(self.integrate(&mut book, order))
    }

    /// Folds a backend copy of the order into the book and notifies observers.
    fn integrate(&self, book: &mut ProgressBook, order: ActiveOrder) -> TrackedOrder {
        let previous = book
            .current
            .as_ref()
            .filter(|tracked| tracked.order.order_id == order.order_id);
        let previous_stage = previous.map(|tracked| tracked.stage);
        let action_in_flight = previous.and_then(|tracked| tracked.action_in_flight);

        if order.status == OrderStatus::Cancelled {
            let tracked = TrackedOrder {
                stage: previous_stage.unwrap_or_else(|| derive_stage(&order)),
                order: order.clone(),
                action_in_flight: None,
            };
            self.clear(book, order, OrderClearReason::Cancelled);
            return tracked;
        }

        let reconciled = reconcile_stage(previous_stage, derive_stage(&order));
        if reconciled.anomaly {
            if let Some(previous) = previous_stage {
                warn!(
                    driver_id = %self.driver_id,
                    order_id = %order.order_id,
                    previous = previous.as_label(),
                    derived = reconciled.stage.as_label(),
                    "delivery stage went backwards"
                );
                self.notifier.publish(SessionEvent::StageAnomaly {
                    order_id: order.order_id,
                    previous,
                    derived: reconciled.stage,
                });
            }
        }

        let tracked = TrackedOrder {
            order,
            stage: reconciled.stage,
            action_in_flight,
        };
        if previous_stage != Some(tracked.stage) {
            self.stage_entered(&tracked);
        } else {
            self.notifier.publish(SessionEvent::OrderUpdated {
                order: tracked.order.clone(),
                stage: tracked.stage,
            });
        }

        if tracked.stage == DeliveryStage::Delivered {
            self.clear(book, tracked.order.clone(), OrderClearReason::Delivered);
        } else {
            book.current = Some(tracked.clone());
        }
        tracked
    }

    fn stage_entered(&self, tracked: &TrackedOrder) {
        info!(
            driver_id = %self.driver_id,
            order_id = %tracked.order.order_id,
            stage = tracked.stage.as_label(),
            status = tracked.order.status.as_str(),
            "delivery stage entered"
        );
        self.metrics
            .stage_transitions_total
            .with_label_values(&[tracked.stage.as_label()])
            .inc();
        self.notifier.publish(SessionEvent::OrderUpdated {
            order: tracked.order.clone(),
            stage: tracked.stage,
        });
    }

    fn clear(&self, book: &mut ProgressBook, order: ActiveOrder, reason: OrderClearReason) {
        if book
            .current
            .as_ref()
            .is_some_and(|tracked| tracked.order.order_id == order.order_id)
        {
            book.current = None;
        }

        self.notifier.publish(SessionEvent::OrderCleared {
            order_id: order.order_id,
            reason,
        });

        if !book.finished.contains(&order.order_id) {
            if book.finished.len() == FINISHED_LEDGER {
                book.finished.pop_front();
            }
            book.finished.push_back(order.order_id);
        }

        if self.history_limit == 0 {
            return;
        }
        if book.history.len() >= self.history_limit {
            book.history.pop_front();
        }
        book.history.push_back(OrderHistoryEntry {
            order,
            reason,
            finished_at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::{Step, derive_stage, plan, reconcile_stage};
    use crate::error::AppError;
    use crate::models::order::{ActiveOrder, DeliveryStage, DriverAction, OrderStatus};

    fn order(status: OrderStatus, arrived: bool) -> ActiveOrder {
        let now = Utc::now();
        ActiveOrder {
            order_id: Uuid::new_v4(),
            status,
            driver_assigned_at: Some(now),
            arrived_at_restaurant_at: arrived.then_some(now),
            picked_up_at: None,
            delivered_at: None,
            snapshot: None,
            updated_at: now,
        }
    }

    #[test]
    fn derives_stage_from_status_and_arrival() {
        let cases = [
            (OrderStatus::Preparing, false, DeliveryStage::Assigned),
            (OrderStatus::Preparing, true, DeliveryStage::WaitingAtRestaurant),
            (OrderStatus::Ready, true, DeliveryStage::WaitingAtRestaurant),
            (OrderStatus::Ready, false, DeliveryStage::Assigned),
            (OrderStatus::PickedUp, true, DeliveryStage::PickedUp),
            (OrderStatus::Delivering, true, DeliveryStage::EnRouteToCustomer),
            (OrderStatus::Delivered, true, DeliveryStage::Delivered),
            (OrderStatus::Pending, true, DeliveryStage::Assigned),
            (
                OrderStatus::Other("ON_HOLD".to_string()),
                true,
                DeliveryStage::Assigned,
            ),
        ];

        for (status, arrived, expected) in cases {
            assert_eq!(
                derive_stage(&order(status.clone(), arrived)),
                expected,
                "{status:?} arrived={arrived}"
            );
        }
    }

    #[test]
    fn local_navigation_step_survives_backend_updates() {
        let reconciled = reconcile_stage(
            Some(DeliveryStage::EnRouteToRestaurant),
            DeliveryStage::Assigned,
        );
        assert_eq!(reconciled.stage, DeliveryStage::EnRouteToRestaurant);
        assert!(!reconciled.anomaly);
    }

    #[test]
    fn lost_arrival_marker_resets_to_assigned_as_anomaly() {
        let reconciled = reconcile_stage(
            Some(DeliveryStage::WaitingAtRestaurant),
            DeliveryStage::Assigned,
        );
        assert_eq!(reconciled.stage, DeliveryStage::Assigned);
        assert!(reconciled.anomaly);
    }

    #[test]
    fn pickup_waits_for_ready() {
        let err = plan(
            DeliveryStage::WaitingAtRestaurant,
            &OrderStatus::Preparing,
            DriverAction::PickUp,
        )
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidStageTransition { .. }));

        assert_eq!(
            plan(
                DeliveryStage::WaitingAtRestaurant,
                &OrderStatus::Ready,
                DriverAction::PickUp
            )
            .unwrap(),
            Step::Remote
        );
    }

    #[test]
    fn pickup_outside_restaurant_is_rejected_even_when_ready() {
        assert!(
            plan(
                DeliveryStage::EnRouteToRestaurant,
                &OrderStatus::Ready,
                DriverAction::PickUp
            )
            .is_err()
        );
    }

    #[test]
    fn pickup_away_from_restaurant_is_out_of_order() {
        match plan(
            DeliveryStage::EnRouteToRestaurant,
            &OrderStatus::Preparing,
            DriverAction::PickUp,
        ) {
            Err(AppError::InvalidStageTransition { reason, .. }) => {
                assert_eq!(reason, "not the next step of the delivery");
            }
            other => panic!("expected stage error, got {other:?}"),
        }
    }

    #[test]
    fn stages_cannot_be_skipped() {
        assert!(
            plan(
                DeliveryStage::Assigned,
                &OrderStatus::Preparing,
                DriverAction::ArriveAtRestaurant
            )
            .is_err()
        );
        assert!(
            plan(
                DeliveryStage::PickedUp,
                &OrderStatus::PickedUp,
                DriverAction::CompleteDelivery
            )
            .is_err()
        );
        assert_eq!(
            plan(
                DeliveryStage::Assigned,
                &OrderStatus::Preparing,
                DriverAction::StartNavigation
            )
            .unwrap(),
            Step::Local(DeliveryStage::EnRouteToRestaurant)
        );
    }

    #[test]
    fn cancel_only_before_pickup() {
        assert_eq!(
            plan(
                DeliveryStage::WaitingAtRestaurant,
                &OrderStatus::Ready,
                DriverAction::Cancel
            )
            .unwrap(),
            Step::Remote
        );
        assert!(
            plan(
                DeliveryStage::PickedUp,
                &OrderStatus::PickedUp,
                DriverAction::Cancel
            )
            .is_err()
        );
    }
}
