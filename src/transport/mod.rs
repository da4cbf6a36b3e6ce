//! Realtime channel between a driver session and the dispatch server.
//!
//! Nothing is buffered: events emitted or pushed while the connection is down
//! are lost, and the session re-fetches authoritative state after a
//! reconnect instead.

pub mod loopback;
pub mod router;
pub mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::events::{ConnectionEvent, InboundEvent, InboundKind, OutboundEvent};

pub type EventHandler = Arc<dyn Fn(&InboundEvent) + Send + Sync>;
pub type ConnectionHandler = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn connect(&self, driver_id: Uuid) -> Result<(), AppError>;

    /// Handlers run on the transport's reader, in delivery order.
    fn on(&self, kind: InboundKind, handler: EventHandler);

    fn on_connection(&self, handler: ConnectionHandler);

    async fn emit(&self, event: OutboundEvent) -> Result<(), AppError>;

    fn is_connected(&self) -> bool;

    async fn disconnect(&self);
}

/// Builds one transport per driver session.
pub trait TransportFactory: Send + Sync {
    fn create(&self, driver_id: Uuid) -> Arc<dyn RealtimeTransport>;
}
