use tokio::sync::broadcast;
use tracing::trace;

use crate::models::events::SessionEvent;

/// Fan-out of session change notifications. Publishing is synchronous and
/// never blocks the transition that produced the event.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<SessionEvent>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _unused_rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: SessionEvent) {
        // no subscribers is fine; the UI may not be attached yet
        if self.tx.send(event).is_err() {
            trace!("session event dropped: no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}
