use std::sync::Mutex;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::models::events::{ConnectionEvent, InboundEvent, InboundKind};
use crate::transport::{ConnectionHandler, EventHandler};

/// Handler registry shared by transport implementations.
#[derive(Default)]
pub struct EventRouter {
    handlers: DashMap<InboundKind, Vec<EventHandler>>,
    connection_handlers: Mutex<Vec<ConnectionHandler>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, kind: InboundKind, handler: EventHandler) {
        self.handlers.entry(kind).or_default().push(handler);
    }

    pub fn on_connection(&self, handler: ConnectionHandler) {
        match self.connection_handlers.lock() {
            Ok(mut handlers) => handlers.push(handler),
            Err(poisoned) => poisoned.into_inner().push(handler),
        }
    }

    /// Returns the number of handlers that saw the event.
    pub fn dispatch(&self, event: &InboundEvent) -> usize {
        // clone out so handlers may register further handlers without deadlocking
        let handlers: Vec<EventHandler> = self
            .handlers
            .get(&event.kind())
            .map(|entry| entry.value().clone())
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!(kind = ?event.kind(), "no handler for inbound event");
        }

        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    pub fn dispatch_text(&self, text: &str) {
        match serde_json::from_str::<InboundEvent>(text) {
            Ok(event) => {
                self.dispatch(&event);
            }
            Err(err) => warn!(error = %err, "dropping malformed inbound frame"),
        }
    }

    pub fn connection_changed(&self, event: ConnectionEvent) {
        let handlers: Vec<ConnectionHandler> = match self.connection_handlers.lock() {
            Ok(handlers) => handlers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for handler in &handlers {
            handler(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use uuid::Uuid;

    use super::EventRouter;
    use crate::models::events::{InboundEvent, InboundKind};

    #[test]
    fn dispatch_reaches_only_matching_kind() {
        let router = EventRouter::new();
        let expired = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(AtomicUsize::new(0));

        let counter = expired.clone();
        router.on(
            InboundKind::OfferExpired,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let counter = cancelled.clone();
        router.on(
            InboundKind::OfferCancelled,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let delivered = router.dispatch(&InboundEvent::OfferExpired {
            assignment_id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
        });

        assert_eq!(delivered, 1);
        assert_eq!(expired.load(Ordering::SeqCst), 1);
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn malformed_frame_is_dropped() {
        let router = EventRouter::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        router.on(
            InboundKind::OfferReceived,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        router.dispatch_text(r#"{"event":"offer_received","data":{"nope":true}}"#);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
