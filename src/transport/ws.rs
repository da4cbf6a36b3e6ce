use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use backoff::ExponentialBackoffBuilder;
use backoff::backoff::Backoff;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::ReconnectPolicy;
use crate::error::AppError;
use crate::models::events::{ConnectionEvent, InboundKind, OutboundEvent};
use crate::observability::metrics::Metrics;
use crate::transport::router::EventRouter;
use crate::transport::{ConnectionHandler, EventHandler, RealtimeTransport, TransportFactory};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_QUEUE: usize = 64;

/// WebSocket client for the dispatch server's driver channel.
pub struct WsTransport {
    inner: Arc<WsInner>,
}

struct WsInner {
    base_url: String,
    token: Option<String>,
    policy: ReconnectPolicy,
    metrics: Arc<Metrics>,
    router: EventRouter,
    connected: AtomicBool,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        policy: ReconnectPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner: Arc::new(WsInner {
                base_url: base_url.into().trim_end_matches('/').to_string(),
                token,
                policy,
                metrics,
                router: EventRouter::new(),
                connected: AtomicBool::new(false),
                outbound: Mutex::new(None),
                task: Mutex::new(None),
            }),
        }
    }
}

fn reconnect_backoff(policy: &ReconnectPolicy) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(policy.initial_delay)
        .with_max_interval(policy.max_delay)
        .with_max_elapsed_time(None)
        .build()
}

impl WsInner {
    fn socket_url(&self, driver_id: Uuid) -> String {
        format!("{}/drivers/{driver_id}/socket", self.base_url)
    }

    async fn open(&self, driver_id: Uuid) -> Result<Socket, AppError> {
        let mut request = self
            .socket_url(driver_id)
            .into_client_request()
            .map_err(|err| AppError::Internal(format!("invalid socket url: {err}")))?;

        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| AppError::Internal(format!("invalid api token: {err}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (socket, _response) = connect_async(request)
            .await
            .map_err(|err| AppError::Network(format!("socket connect failed: {err}")))?;
        Ok(socket)
    }

    /// Bounded exponential retry. `None` once the policy is exhausted.
    async fn open_with_retry(&self, driver_id: Uuid) -> Option<Socket> {
        let mut backoff = reconnect_backoff(&self.policy);
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.open(driver_id).await {
                Ok(socket) => {
                    self.metrics
                        .transport_reconnects_total
                        .with_label_values(&["success"])
                        .inc();
                    return Some(socket);
                }
                Err(err) => {
                    self.metrics
                        .transport_reconnects_total
                        .with_label_values(&["failure"])
                        .inc();

                    if attempts >= self.policy.max_attempts {
                        warn!(driver_id = %driver_id, attempts, error = %err, "giving up on socket");
                        return None;
                    }

                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(self.policy.max_delay);
                    warn!(
                        driver_id = %driver_id,
                        attempt = attempts,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "socket connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn set_outbound(&self, sender: Option<mpsc::Sender<Message>>) {
        match self.outbound.lock() {
            Ok(mut slot) => *slot = sender,
            Err(poisoned) => *poisoned.into_inner() = sender,
        }
    }

    fn outbound(&self) -> Option<mpsc::Sender<Message>> {
        match self.outbound.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Installs a fresh outbound queue and marks the transport connected.
    /// Done before connection handlers run so they can emit right away.
    fn attach(&self) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        self.set_outbound(Some(tx));
        self.connected.store(true, Ordering::SeqCst);
        rx
    }

    /// Pumps one socket until it drops.
    async fn pump(&self, socket: Socket, mut rx: mpsc::Receiver<Message>) {
        let (mut sink, mut stream) = socket.split();

        loop {
            tokio::select! {
                Some(message) = rx.recv() => {
                    if let Err(err) = sink.send(message).await {
                        warn!(error = %err, "socket write failed");
                        break;
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.router.dispatch_text(&text),
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "socket read failed");
                        break;
                    }
                },
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        self.set_outbound(None);
    }

    async fn run(
        self: Arc<Self>,
        driver_id: Uuid,
        mut socket: Socket,
        mut outbound: mpsc::Receiver<Message>,
    ) {
        loop {
            self.pump(socket, outbound).await;
            self.router.connection_changed(ConnectionEvent::Disconnected);
            info!(driver_id = %driver_id, "socket dropped, reconnecting");

            match self.open_with_retry(driver_id).await {
                Some(next) => {
                    socket = next;
                    // the session must be told before any frame is pumped
                    outbound = self.attach();
                    self.router.connection_changed(ConnectionEvent::Reconnected);
                }
                None => {
                    error!(driver_id = %driver_id, "socket reconnect budget exhausted");
                    self.router.connection_changed(ConnectionEvent::GaveUp);
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl RealtimeTransport for WsTransport {
    async fn connect(&self, driver_id: Uuid) -> Result<(), AppError> {
        if self.is_connected() {
            return Ok(());
        }

        let socket = self
            .inner
            .open_with_retry(driver_id)
            .await
            .ok_or_else(|| AppError::Network("dispatch socket unreachable".to_string()))?;

        let outbound = self.inner.attach();
        self.inner.router.connection_changed(ConnectionEvent::Connected);
        info!(driver_id = %driver_id, "socket connected");

        let handle = tokio::spawn(self.inner.clone().run(driver_id, socket, outbound));
        let previous = match self.inner.task.lock() {
            Ok(mut slot) => slot.replace(handle),
            Err(poisoned) => poisoned.into_inner().replace(handle),
        };
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    fn on(&self, kind: InboundKind, handler: EventHandler) {
        self.inner.router.on(kind, handler);
    }

    fn on_connection(&self, handler: ConnectionHandler) {
        self.inner.router.on_connection(handler);
    }

    async fn emit(&self, event: OutboundEvent) -> Result<(), AppError> {
        let sender = self
            .inner
            .outbound()
            .ok_or_else(|| AppError::Network("transport disconnected".to_string()))?;

        let json = serde_json::to_string(&event)
            .map_err(|err| AppError::Internal(format!("failed to encode event: {err}")))?;

        sender
            .send(Message::Text(json))
            .await
            .map_err(|_| AppError::Network("transport disconnected".to_string()))
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        let handle = match self.inner.task.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }

        self.inner.set_outbound(None);
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            self.inner
                .router
                .connection_changed(ConnectionEvent::Disconnected);
        }
    }
}

/// Opens one [`WsTransport`] per driver against the same server.
pub struct WsTransportFactory {
    pub base_url: String,
    pub token: Option<String>,
    pub policy: ReconnectPolicy,
    pub metrics: Arc<Metrics>,
}

impl TransportFactory for WsTransportFactory {
    fn create(&self, _driver_id: Uuid) -> Arc<dyn RealtimeTransport> {
        Arc::new(WsTransport::new(
            self.base_url.clone(),
            self.token.clone(),
            self.policy.clone(),
            self.metrics.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use backoff::backoff::Backoff;

    use super::reconnect_backoff;
    use crate::config::ReconnectPolicy;

    #[test]
    fn backoff_never_exceeds_ceiling() {
        let policy = ReconnectPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(800),
        };
        let mut backoff = reconnect_backoff(&policy);

        for _ in 0..policy.max_attempts {
            let delay = backoff.next_backoff().unwrap();
            // randomization may push a single delay up to 1.5x the interval
            assert!(delay <= Duration::from_millis(1_200));
        }
    }
}
