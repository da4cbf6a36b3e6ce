use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::order::{DeliveryStage, DriverAction};
use crate::models::presence::PresenceStatus;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AppError {
    #[error("current location could not be resolved")]
    LocationUnavailable,

    #[error("cannot go from {from:?} to {to:?}")]
    InvalidPresenceTransition {
        from: PresenceStatus,
        to: PresenceStatus,
    },

    #[error("assignment {assignment_id} is no longer available")]
    AssignmentUnavailable { assignment_id: Uuid },

    #[error("{action:?} not allowed at {stage:?}: {reason}")]
    InvalidStageTransition {
        stage: Option<DeliveryStage>,
        action: DriverAction,
        reason: String,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("offer {assignment_id} was already resolved")]
    StaleOffer { assignment_id: Uuid },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backend rejected request: {0}")]
    Backend(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::LocationUnavailable => "location_unavailable",
            AppError::InvalidPresenceTransition { .. } => "invalid_presence_transition",
            AppError::AssignmentUnavailable { .. } => "assignment_unavailable",
            AppError::InvalidStageTransition { .. } => "invalid_stage_transition",
            AppError::Network(_) => "network_error",
            AppError::StaleOffer { .. } => "stale_offer",
            AppError::NotFound(_) => "not_found",
            AppError::BadRequest(_) => "bad_request",
            AppError::Conflict(_) => "conflict",
            AppError::Backend(_) => "backend_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    pub(crate) fn stage_blocked(
        stage: Option<DeliveryStage>,
        action: DriverAction,
        reason: impl Into<String>,
    ) -> Self {
        AppError::InvalidStageTransition {
            stage,
            action,
            reason: reason.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::LocationUnavailable => {
                (StatusCode::UNPROCESSABLE_ENTITY, self.to_string())
            }
            AppError::InvalidPresenceTransition { .. } => (StatusCode::CONFLICT, self.to_string()),
            // losing the race is routine for multi-driver dispatch
            AppError::AssignmentUnavailable { .. } => {
                (StatusCode::CONFLICT, "already taken".to_string())
            }
            AppError::InvalidStageTransition { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, self.to_string())
            }
            AppError::Network(msg) => (StatusCode::GATEWAY_TIMEOUT, msg.clone()),
            AppError::StaleOffer { .. } => (StatusCode::CONFLICT, self.to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Backend(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": message,
            "code": self.code(),
        }));

        (status, body).into_response()
    }
}
