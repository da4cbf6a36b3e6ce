use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::engine::session::{DriverSession, SessionDeps};
use crate::error::AppError;
use crate::observability::metrics::Metrics;

pub struct AppState {
    pub sessions: DashMap<Uuid, Arc<DriverSession>>,
    pub deps: SessionDeps,
    pub config: SessionConfig,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    /// The metrics handle is shared with transports built outside the state.
    pub fn new(deps: SessionDeps, config: SessionConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            sessions: DashMap::new(),
            deps,
            config,
            metrics,
        }
    }

    pub fn session(&self, driver_id: Uuid) -> Result<Arc<DriverSession>, AppError> {
        self.sessions
            .get(&driver_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("no session for driver {driver_id}")))
    }

    /// Closes every open session; used on process shutdown.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<DriverSession>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.sessions.clear();

        for session in sessions {
            session.shutdown().await;
        }
    }
}
