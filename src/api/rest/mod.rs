pub mod offers;
pub mod orders;
pub mod sessions;
pub mod ws;

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(sessions::router())
        .merge(offers::router())
        .merge(orders::router())
        .route("/drivers/:id/events", get(ws::ws_handler))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    sessions: usize,
    connected: usize,
    online: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let mut connected = 0;
    let mut online = 0;
    for entry in state.sessions.iter() {
        if entry.is_connected() {
            connected += 1;
        }
        if entry.presence().status().is_online() {
            online += 1;
        }
    }

    Json(HealthResponse {
        status: "ok",
        sessions: state.sessions.len(),
        connected,
        online,
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err).into_response(),
    }
}
