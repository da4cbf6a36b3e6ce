use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::geo;
use crate::models::presence::GeoPoint;

/// Source of device location fixes.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    fn permission_granted(&self) -> bool;

    /// Latest fix without waiting.
    fn sample(&self) -> Option<GeoPoint>;

    /// Waits until a fix exists. Callers bound the wait.
    async fn current_location(&self) -> Option<GeoPoint>;
}

/// Location fixes reported by the device UI, one feed per session.
pub struct LocationFeed {
    permission: AtomicBool,
    tx: watch::Sender<Option<GeoPoint>>,
}

impl LocationFeed {
    pub fn new(permission_granted: bool) -> Self {
        let (tx, _unused_rx) = watch::channel(None);
        Self {
            permission: AtomicBool::new(permission_granted),
            tx,
        }
    }

    pub fn set_permission(&self, granted: bool) {
        self.permission.store(granted, Ordering::SeqCst);
        if !granted {
            self.tx.send_replace(None);
        }
    }

    /// Returns false and keeps the previous fix when the point is invalid.
    pub fn report(&self, point: GeoPoint) -> bool {
        if !geo::is_valid(&point) {
            return false;
        }
        self.tx.send_replace(Some(point));
        true
    }
}

#[async_trait]
impl LocationProvider for LocationFeed {
    fn permission_granted(&self) -> bool {
        self.permission.load(Ordering::SeqCst)
    }

    fn sample(&self) -> Option<GeoPoint> {
        if !self.permission_granted() {
            return None;
        }
        *self.tx.borrow()
    }

    async fn current_location(&self) -> Option<GeoPoint> {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(point) = *rx.borrow_and_update() {
                return Some(point);
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }
}
