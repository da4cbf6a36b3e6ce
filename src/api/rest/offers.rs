use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::offer::{DeclineReason, OfferOutcome, OfferView, ResolvedOffer};
use crate::models::order::TrackedOrder;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/drivers/:id/offer", get(get_offer))
        .route(
            "/drivers/:id/offers/:assignment_id/accept",
            post(accept_offer),
        )
        .route(
            "/drivers/:id/offers/:assignment_id/decline",
            post(decline_offer),
        )
}

#[derive(Deserialize)]
pub struct DeclineRequest {
    pub reason: DeclineReason,
}

#[derive(Serialize)]
pub struct OfferSlotView {
    pub offer: Option<OfferView>,
    pub recent: Vec<ResolvedOffer>,
}

#[derive(Serialize)]
pub struct DeclineView {
    pub assignment_id: Uuid,
    pub outcome: Option<OfferOutcome>,
}

async fn get_offer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<OfferSlotView>, AppError> {
    let session = state.session(id)?;
    let offers = session.offers();

    Ok(Json(OfferSlotView {
        offer: offers.current(),
        recent: offers.resolved(),
    }))
}

async fn accept_offer(
    State(state): State<Arc<AppState>>,
    Path((id, assignment_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<TrackedOrder>, AppError> {
    let session = state.session(id)?;
    let tracked = session.accept(assignment_id).await?;
    Ok(Json(tracked))
}

async fn decline_offer(
    State(state): State<Arc<AppState>>,
    Path((id, assignment_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<DeclineRequest>,
) -> Result<Json<DeclineView>, AppError> {
    let session = state.session(id)?;
    session.decline(assignment_id, payload.reason).await?;

    Ok(Json(DeclineView {
        assignment_id,
        outcome: session.offers().outcome_of(assignment_id),
    }))
}
