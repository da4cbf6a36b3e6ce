use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::engine::location::LocationFeed;
use crate::engine::session::DriverSession;
use crate::error::AppError;
use crate::models::offer::OfferView;
use crate::models::order::TrackedOrder;
use crate::models::presence::{DriverPresence, GeoPoint, PresenceHealth};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/drivers/:id/session",
            post(open_session).delete(close_session).get(get_session),
        )
        .route("/drivers/:id/online", post(go_online))
        .route("/drivers/:id/offline", post(go_offline))
        .route("/drivers/:id/busy", post(set_busy))
        .route("/drivers/:id/available", post(set_available))
        .route("/drivers/:id/presence", get(get_presence))
        .route("/drivers/:id/location", patch(update_location))
}

#[derive(Deserialize, Default)]
pub struct OpenSessionRequest {
    #[serde(default)]
    pub location_permission: bool,
    pub location: Option<GeoPoint>,
}

#[derive(Deserialize)]
pub struct UpdateLocationRequest {
    pub location: GeoPoint,
    pub permission_granted: Option<bool>,
}

#[derive(Serialize)]
pub struct SessionView {
    pub driver_id: Uuid,
    pub connected: bool,
    pub presence: DriverPresence,
    pub health: PresenceHealth,
    pub offer: Option<OfferView>,
    pub order: Option<TrackedOrder>,
}

#[derive(Serialize)]
pub struct PresenceView {
    pub presence: DriverPresence,
    pub health: PresenceHealth,
}

#[derive(Serialize)]
pub struct LocationView {
    pub location: GeoPoint,
    pub next_stop_km: Option<f64>,
}

fn session_view(session: &DriverSession) -> SessionView {
    SessionView {
        driver_id: session.driver_id(),
        connected: session.is_connected(),
        presence: session.presence().snapshot(),
        health: session.presence().health(),
        offer: session.offers().current(),
        order: session.progress().current(),
    }
}

fn presence_view(session: &DriverSession) -> PresenceView {
    PresenceView {
        presence: session.presence().snapshot(),
        health: session.presence().health(),
    }
}

async fn open_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    payload: Option<Json<OpenSessionRequest>>,
) -> Result<(StatusCode, Json<SessionView>), AppError> {
    if state.sessions.contains_key(&id) {
        return Err(AppError::Conflict(format!("driver {id} already has a session")));
    }

    let payload = payload.map(|Json(payload)| payload).unwrap_or_default();
    let location = Arc::new(LocationFeed::new(payload.location_permission));
    if let Some(point) = payload.location {
        if !location.report(point) {
            return Err(AppError::BadRequest("invalid coordinates".to_string()));
        }
    }

    let session = DriverSession::start(
        id,
        location,
        &state.deps,
        state.config.clone(),
        state.metrics.clone(),
    )
    .await?;

    let raced = match state.sessions.entry(id) {
        Entry::Occupied(_) => true,
        Entry::Vacant(vacant) => {
            vacant.insert(session.clone());
            false
        }
    };
    if raced {
        session.shutdown().await;
        return Err(AppError::Conflict(format!("driver {id} already has a session")));
    }

    info!(driver_id = %id, "session opened");
    Ok((StatusCode::CREATED, Json(session_view(&session))))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, AppError> {
    let session = state.session(id)?;
    Ok(Json(session_view(&session)))
}

async fn close_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let (_, session) = state
        .sessions
        .remove(&id)
        .ok_or_else(|| AppError::NotFound(format!("no session for driver {id}")))?;
    session.shutdown().await;
    Ok(StatusCode::NO_CONTENT)
}

async fn go_online(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<PresenceView>, AppError> {
    let session = state.session(id)?;
    session.go_online().await?;
    Ok(Json(presence_view(&session)))
}

async fn go_offline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<PresenceView>, AppError> {
    let session = state.session(id)?;
    session.go_offline().await?;
    Ok(Json(presence_view(&session)))
}

async fn set_busy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<PresenceView>, AppError> {
    let session = state.session(id)?;
    session.set_busy().await?;
    Ok(Json(presence_view(&session)))
}

async fn set_available(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<PresenceView>, AppError> {
    let session = state.session(id)?;
    session.set_available().await?;
    Ok(Json(presence_view(&session)))
}

async fn get_presence(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<PresenceView>, AppError> {
    let session = state.session(id)?;
    Ok(Json(presence_view(&session)))
}

async fn update_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateLocationRequest>,
) -> Result<Json<LocationView>, AppError> {
    let session = state.session(id)?;
    if let Some(granted) = payload.permission_granted {
        session.location().set_permission(granted);
    }
    session.report_location(payload.location)?;

    Ok(Json(LocationView {
        location: payload.location,
        next_stop_km: session.progress().next_stop_distance_km(payload.location),
    }))
}
