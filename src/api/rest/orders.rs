use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::order::{
    ActiveOrder, CancellationReason, DeliveryProof, OrderHistoryEntry, TrackedOrder,
};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/drivers/:id/order", get(get_order))
        .route("/drivers/:id/order/navigate", post(start_navigation))
        .route("/drivers/:id/order/arrive", post(arrive))
        .route("/drivers/:id/order/pickup", post(pickup))
        .route("/drivers/:id/order/start-delivery", post(start_delivery))
        .route("/drivers/:id/order/complete", post(complete_delivery))
        .route("/drivers/:id/order/cancel", post(cancel_order))
        .route("/drivers/:id/history", get(history))
}

#[derive(Deserialize, Default)]
pub struct CompleteRequest {
    pub proof: Option<DeliveryProof>,
}

#[derive(Deserialize)]
pub struct CancelRequest {
    pub reason: CancellationReason,
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TrackedOrder>, AppError> {
    let session = state.session(id)?;
    let tracked = session
        .progress()
        .current()
        .ok_or_else(|| AppError::NotFound(format!("driver {id} has no active order")))?;
    Ok(Json(tracked))
}

async fn start_navigation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TrackedOrder>, AppError> {
    let session = state.session(id)?;
    Ok(Json(session.start_navigation()?))
}

async fn arrive(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TrackedOrder>, AppError> {
    let session = state.session(id)?;
    Ok(Json(session.arrive().await?))
}

async fn pickup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TrackedOrder>, AppError> {
    let session = state.session(id)?;
    Ok(Json(session.pickup().await?))
}

async fn start_delivery(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TrackedOrder>, AppError> {
    let session = state.session(id)?;
    Ok(Json(session.start_delivery().await?))
}

async fn complete_delivery(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    payload: Option<Json<CompleteRequest>>,
) -> Result<Json<TrackedOrder>, AppError> {
    let session = state.session(id)?;
    let payload = payload.map(|Json(payload)| payload).unwrap_or_default();
    Ok(Json(session.complete_delivery(payload.proof).await?))
}

async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CancelRequest>,
) -> Result<Json<ActiveOrder>, AppError> {
    let session = state.session(id)?;
    Ok(Json(session.cancel_order(payload.reason).await?))
}

async fn history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<OrderHistoryEntry>>, AppError> {
    let session = state.session(id)?;
    Ok(Json(session.progress().history()))
}
