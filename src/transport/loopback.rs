use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::events::{ConnectionEvent, InboundEvent, InboundKind, OutboundEvent};
use crate::transport::router::EventRouter;
use crate::transport::{ConnectionHandler, EventHandler, RealtimeTransport, TransportFactory};

/// In-process transport: records what the session emits and lets the caller
/// play the dispatch server's side of the connection.
#[derive(Default)]
pub struct LoopbackTransport {
    router: EventRouter,
    connected: AtomicBool,
    driver_id: Mutex<Option<Uuid>>,
    sent: Mutex<Vec<OutboundEvent>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a server event. Returns false when the connection is down and
    /// the event is lost.
    pub fn deliver(&self, event: InboundEvent) -> bool {
        if !self.is_connected() {
            debug!(kind = ?event.kind(), "loopback dropped event while disconnected");
            return false;
        }
        self.router.dispatch(&event);
        true
    }

    pub fn drop_connection(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.router.connection_changed(ConnectionEvent::Disconnected);
        }
    }

    pub fn restore_connection(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.router.connection_changed(ConnectionEvent::Reconnected);
        }
    }

    pub fn driver_id(&self) -> Option<Uuid> {
        *self.driver_id.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn sent(&self) -> Vec<OutboundEvent> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn clear_sent(&self) {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

#[async_trait]
impl RealtimeTransport for LoopbackTransport {
    async fn connect(&self, driver_id: Uuid) -> Result<(), AppError> {
        *self.driver_id.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(driver_id);
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.router.connection_changed(ConnectionEvent::Connected);
        }
        Ok(())
    }

    fn on(&self, kind: InboundKind, handler: EventHandler) {
        self.router.on(kind, handler);
    }

    fn on_connection(&self, handler: ConnectionHandler) {
        self.router.on_connection(handler);
    }

    async fn emit(&self, event: OutboundEvent) -> Result<(), AppError> {
        if !self.is_connected() {
            return Err(AppError::Network("transport disconnected".to_string()));
        }
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.router.connection_changed(ConnectionEvent::Disconnected);
        }
    }
}

/// Hands out one [`LoopbackTransport`] per driver and keeps it reachable so
/// the caller can drive the server side.
#[derive(Default)]
pub struct LoopbackFactory {
    transports: DashMap<Uuid, Arc<LoopbackTransport>>,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self, driver_id: Uuid) -> Option<Arc<LoopbackTransport>> {
        self.transports.get(&driver_id).map(|entry| entry.value().clone())
    }
}

impl TransportFactory for LoopbackFactory {
    fn create(&self, driver_id: Uuid) -> Arc<dyn RealtimeTransport> {
        let transport = Arc::new(LoopbackTransport::new());
        self.transports.insert(driver_id, transport.clone());
        transport
    }
}
