//! One driver login: owns the transport, the presence manager, the offer slot
//! and the active order, and routes realtime events between them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::engine::location::LocationFeed;
use crate::engine::notify::Notifier;
use crate::engine::offer::{OfferManager, ReceiveDecision};
use crate::engine::presence::PresenceManager;
use crate::engine::progress::OrderProgress;
use crate::error::AppError;
use crate::models::events::{
    ConnectionEvent, InboundEvent, InboundKind, OutboundEvent, SessionEvent,
};
use crate::models::offer::{AssignmentOffer, DeclineReason};
use crate::models::order::{ActiveOrder, CancellationReason, DeliveryProof, TrackedOrder};
use crate::models::presence::{DriverPresence, GeoPoint, PresenceStatus};
use crate::observability::metrics::Metrics;
use crate::repository::OrderRepository;
use crate::transport::{RealtimeTransport, TransportFactory};

/// Collaborators shared by every session of the process.
#[derive(Clone)]
pub struct SessionDeps {
    pub repository: Arc<dyn OrderRepository>,
    pub transports: Arc<dyn TransportFactory>,
}

pub struct DriverSession {
    driver_id: Uuid,
    presence: PresenceManager,
    offers: OfferManager,
    progress: OrderProgress,
    transport: Arc<dyn RealtimeTransport>,
    location: Arc<LocationFeed>,
    notifier: Notifier,
    metrics: Arc<Metrics>,
    poller: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl DriverSession {
    pub async fn start(
        driver_id: Uuid,
        location: Arc<LocationFeed>,
        deps: &SessionDeps,
        config: SessionConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>, AppError> {
        let notifier = Notifier::new(config.event_buffer_size);
        let transport = deps.transports.create(driver_id);

        let presence = PresenceManager::new(
            driver_id,
            deps.repository.clone(),
            transport.clone(),
            location.clone(),
            notifier.clone(),
            metrics.clone(),
            config.clone(),
        );
        let offers = OfferManager::new(
            driver_id,
            deps.repository.clone(),
            notifier.clone(),
            metrics.clone(),
            config.request_timeout,
        );
        let progress = OrderProgress::new(
            driver_id,
            deps.repository.clone(),
            notifier.clone(),
            metrics.clone(),
            config.request_timeout,
            config.order_history_limit,
        );

        let session = Arc::new(Self {
            driver_id,
            presence,
            offers,
            progress,
            transport,
            location,
            notifier,
            metrics,
            poller: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        session.register_handlers();
        session.transport.connect(driver_id).await?;
        session.metrics.active_sessions.inc();

        if let Err(err) = session.progress.refresh().await {
            warn!(driver_id = %driver_id, error = %err, "initial active order fetch failed");
        }

        if let Some(period) = config.order_poll_interval {
            let poller = tokio::spawn(poll_loop(Arc::downgrade(&session), period));
            *session
                .poller
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(poller);
        }

        info!(driver_id = %driver_id, "driver session started");
        Ok(session)
    }

    pub fn driver_id(&self) -> Uuid {
        self.driver_id
    }

    pub fn presence(&self) -> &PresenceManager {
        &self.presence
    }

    pub fn offers(&self) -> &OfferManager {
        &self.offers
    }

    pub fn progress(&self) -> &OrderProgress {
        &self.progress
    }

    pub fn location(&self) -> &LocationFeed {
        &self.location
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.notifier.subscribe()
    }

    pub async fn go_online(&self) -> Result<DriverPresence, AppError> {
        self.presence.go_online().await?;
        self.align_presence().await;
        Ok(self.presence.snapshot())
    }

    pub async fn go_offline(&self) -> Result<DriverPresence, AppError> {
        if self.progress.has_active_order() {
            return Err(AppError::InvalidPresenceTransition {
                from: self.presence.status(),
                to: PresenceStatus::Offline,
            });
        }
        self.presence.go_offline().await
    }

    pub async fn set_busy(&self) -> Result<DriverPresence, AppError> {
        self.presence.set_busy().await
    }

    /// Refused while an order is active: the driver stays busy until it is
    /// delivered or cancelled.
    pub async fn set_available(&self) -> Result<DriverPresence, AppError> {
        if self.progress.has_active_order() {
            return Err(AppError::InvalidPresenceTransition {
                from: self.presence.status(),
                to: PresenceStatus::Online,
            });
        }
        self.presence.set_available().await
    }

    pub fn report_location(&self, point: GeoPoint) -> Result<(), AppError> {
        if !self.location.report(point) {
            return Err(AppError::BadRequest(format!(
                "invalid coordinates {}, {}",
                point.lat, point.lng
            )));
        }
        Ok(())
    }

    pub async fn accept(&self, assignment_id: Uuid) -> Result<TrackedOrder, AppError> {
        if let Some(active) = self.progress.current() {
            return Err(AppError::Conflict(format!(
                "order {} is still in progress",
                active.order.order_id
            )));
        }
        // pinned ONLINE until BUSY; go_offline is refused meanwhile
        let hold = self.presence.hold_online()?;

        let order = self.offers.accept(assignment_id).await?;
        let tracked = self.progress.adopt(order);
        if let Err(err) = self.presence.set_busy().await {
            warn!(driver_id = %self.driver_id, error = %err, "accepted order but could not mark busy");
        }
        drop(hold);
        Ok(tracked)
    }

    pub async fn decline(&self, assignment_id: Uuid, reason: DeclineReason) -> Result<(), AppError> {
        self.offers.decline(assignment_id, reason).await
    }

    pub fn start_navigation(&self) -> Result<TrackedOrder, AppError> {
        self.progress.start_navigation()
    }

    pub async fn arrive(&self) -> Result<TrackedOrder, AppError> {
        self.progress.arrive().await
    }

    pub async fn pickup(&self) -> Result<TrackedOrder, AppError> {
        self.progress.pickup().await
    }

    pub async fn start_delivery(&self) -> Result<TrackedOrder, AppError> {
        self.progress.start_delivery().await
    }

    pub async fn complete_delivery(
        &self,
        proof: Option<DeliveryProof>,
    ) -> Result<TrackedOrder, AppError> {
        let tracked = self.progress.complete_delivery(proof).await?;
        self.align_presence().await;
        Ok(tracked)
    }

    pub async fn cancel_order(&self, reason: CancellationReason) -> Result<ActiveOrder, AppError> {
        let order = self.progress.cancel(reason).await?;
        self.align_presence().await;
        Ok(order)
    }

    pub async fn refresh(&self) -> Result<Option<TrackedOrder>, AppError> {
        let tracked = self.progress.refresh().await?;
        self.align_presence().await;
        Ok(tracked)
    }

    /// Logout. Stops every loop and timer the session owns; safe to call twice.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let poller = self
            .poller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(poller) = poller {
            poller.abort();
        }

        self.offers.shutdown();
        if self.presence.status() == PresenceStatus::Online {
            if let Err(err) = self.presence.go_offline().await {
                warn!(driver_id = %self.driver_id, error = %err, "could not report offline on logout");
            }
        }
        self.presence.shutdown();

        if self.transport.is_connected() {
            if let Err(err) = self
                .transport
                .emit(OutboundEvent::LeaveDriverRoom {
                    driver_id: self.driver_id,
                })
                .await
            {
                debug!(driver_id = %self.driver_id, error = %err, "leave room not delivered");
            }
        }
        self.transport.disconnect().await;
        self.metrics.active_sessions.dec();

        info!(driver_id = %self.driver_id, "driver session closed");
    }

    /// Busy exactly while an order is active.
    async fn align_presence(&self) {
        let active = self.progress.has_active_order();
        let result = match (self.presence.status(), active) {
            (PresenceStatus::Busy, false) => self.presence.set_available().await.map(|_| ()),
            (PresenceStatus::Online, true) => self.presence.set_busy().await.map(|_| ()),
            _ => Ok(()),
        };
        if let Err(err) = result {
            warn!(driver_id = %self.driver_id, error = %err, "presence not aligned with active order");
        }
    }

    fn register_handlers(self: &Arc<Self>) {
        let session = Arc::downgrade(self);
        for kind in InboundKind::ALL {
            let session = session.clone();
            self.transport.on(
                kind,
                Arc::new(move |event: &InboundEvent| {
                    if let Some(session) = session.upgrade() {
                        session.route(event);
                    }
                }),
            );
        }

        self.transport
            .on_connection(Arc::new(move |event: ConnectionEvent| {
                if let Some(session) = session.upgrade() {
                    session.connection_changed(event);
                }
            }));
    }

    fn route(self: &Arc<Self>, event: &InboundEvent) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        match event {
            InboundEvent::OfferReceived(offer) => self.offer_received(offer.clone()),
            InboundEvent::OfferExpired { assignment_id, .. } => {
                self.offers.remote_expired(*assignment_id);
            }
            InboundEvent::OfferCancelled {
                assignment_id,
                reason,
                ..
            } => {
                debug!(assignment_id = %assignment_id, reason = ?reason, "offer cancelled by dispatcher");
                self.offers.remote_cancelled(*assignment_id);
            }
            InboundEvent::OfferAccepted {
                assignment_id,
                driver_id,
                ..
            } => {
                if *driver_id == self.driver_id {
                    debug!(assignment_id = %assignment_id, "own acceptance echoed back");
                } else {
                    self.offers.remote_accepted_by_other(*assignment_id);
                }
            }
            InboundEvent::DriverStatusUpdated {
                driver_id, status, ..
            } => {
                if *driver_id == self.driver_id && *status != self.presence.status() {
                    debug!(
                        driver_id = %driver_id,
                        server = status.as_str(),
                        local = self.presence.status().as_str(),
                        "server presence differs from local"
                    );
                }
            }
            InboundEvent::OrderUpdated(order) => {
                if self.progress.apply_update(order.clone()).is_some() {
                    self.spawn_align();
                }
            }
        }
    }

    fn offer_received(&self, offer: AssignmentOffer) {
        let gate = match self.presence.status() {
            PresenceStatus::Online if self.progress.has_active_order() => {
                Some(ReceiveDecision::ActiveOrderInProgress)
            }
            PresenceStatus::Online => None,
            PresenceStatus::Busy if self.progress.has_active_order() => {
                Some(ReceiveDecision::ActiveOrderInProgress)
            }
            PresenceStatus::Busy | PresenceStatus::Offline => Some(ReceiveDecision::NotOnline),
        };

        match gate {
            Some(decision) => self.offers.record_ignored(&offer, decision),
            None => {
                self.offers.receive(offer);
            }
        }
    }

    fn connection_changed(self: &Arc<Self>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                self.notifier
                    .publish(SessionEvent::ConnectionChanged { connected: true });
            }
            ConnectionEvent::Disconnected => {
                warn!(driver_id = %self.driver_id, "realtime connection lost");
                self.notifier
                    .publish(SessionEvent::ConnectionChanged { connected: false });
            }
            ConnectionEvent::Reconnected => {
                info!(driver_id = %self.driver_id, "realtime connection restored, resyncing");
                self.notifier
                    .publish(SessionEvent::ConnectionChanged { connected: true });
                // anything pushed while we were away is lost
                self.offers.invalidate_pending();
                self.spawn_resync();
            }
            ConnectionEvent::GaveUp => {
                error!(driver_id = %self.driver_id, "realtime connection could not be restored");
                self.notifier
                    .publish(SessionEvent::ConnectionChanged { connected: false });
            }
        }
    }

    fn spawn_align(self: &Arc<Self>) {
        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            if let Some(session) = session.upgrade() {
                session.align_presence().await;
            }
        });
    }

    fn spawn_resync(self: &Arc<Self>) {
        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            let Some(session) = session.upgrade() else {
                return;
            };
            if session.closed.load(Ordering::SeqCst) {
                return;
            }
            session.presence.resync().await;
            if let Err(err) = session.refresh().await {
                warn!(driver_id = %session.driver_id, error = %err, "resync fetch failed");
            }
        });
    }
}

async fn poll_loop(session: Weak<DriverSession>, period: Duration) {
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(session) = session.upgrade() else {
            break;
        };
        if !session.presence.status().is_online() {
            continue;
        }
        if let Err(err) = session.refresh().await {
            debug!(driver_id = %session.driver_id, error = %err, "active order poll failed");
        }
    }
}
