//! Backend of record for orders and driver state.
//!
//! The dispatch core only talks to the backend through [`OrderRepository`];
//! `http` is the production client and `memory` an in-process backend used by
//! tests and local runs.

pub mod http;
pub mod memory;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::offer::DeclineReason;
use crate::models::order::{ActiveOrder, CancellationReason, DeliveryProof};
use crate::models::presence::{GeoPoint, PresenceStatus};

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Fails with [`AppError::AssignmentUnavailable`] when another driver won
    /// the order or the dispatcher withdrew it.
    async fn accept_assignment_offer(&self, assignment_id: Uuid) -> Result<ActiveOrder, AppError>;

    async fn decline_assignment_offer(
        &self,
        assignment_id: Uuid,
        reason: DeclineReason,
    ) -> Result<(), AppError>;

    async fn arrive_at_restaurant(&self, order_id: Uuid) -> Result<ActiveOrder, AppError>;

    /// The backend re-validates that the restaurant marked the order ready.
    async fn pickup_order(&self, order_id: Uuid) -> Result<ActiveOrder, AppError>;

    async fn start_delivery(&self, order_id: Uuid) -> Result<ActiveOrder, AppError>;

    async fn complete_delivery(
        &self,
        order_id: Uuid,
        proof: Option<DeliveryProof>,
    ) -> Result<ActiveOrder, AppError>;

    async fn cancel_order(&self, order_id: Uuid, reason: CancellationReason)
    -> Result<(), AppError>;

    async fn update_driver_state(
        &self,
        driver_id: Uuid,
        status: PresenceStatus,
        location: Option<GeoPoint>,
    ) -> Result<(), AppError>;

    async fn send_heartbeat(
        &self,
        driver_id: Uuid,
        location: Option<GeoPoint>,
    ) -> Result<(), AppError>;

    async fn fetch_active_order(&self, driver_id: Uuid) -> Result<Option<ActiveOrder>, AppError>;
}

/// Bounds a repository call so a hung request surfaces as
/// [`AppError::Network`] instead of blocking the caller.
pub async fn bounded<T, F>(timeout: Duration, call: &str, fut: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Network(format!(
            "{call} timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}
