//! Driver presence: the OFFLINE / ONLINE / BUSY machine plus the heartbeat
//! and location loops that run while the driver is online.
//!
//! ```text
//! OFFLINE --go_online--> ONLINE --set_busy--> BUSY
//!    ^                     |  ^                 |
//!    +-----go_offline------+  +--set_available--+
//! ```
//!
//! Heartbeat failures never change the status; they only feed the advisory
//! `degraded` health signal.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::engine::location::LocationProvider;
use crate::engine::notify::Notifier;
use crate::error::AppError;
use crate::models::events::{OutboundEvent, SessionEvent};
use crate::models::presence::{DriverPresence, GeoPoint, PresenceHealth, PresenceStatus};
use crate::observability::metrics::Metrics;
use crate::repository::{OrderRepository, bounded};
use crate::transport::RealtimeTransport;

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceCommand {
    GoOnline {
        location: Option<GeoPoint>,
        permission_granted: bool,
    },
    GoOffline,
    SetBusy,
    SetAvailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceEffect {
    StartLoops,
    StopLoops,
    Announce(PresenceStatus),
}

/// Pure presence transition. An empty effect list means the command was an
/// idempotent no-op.
pub fn transition(
    current: &DriverPresence,
    command: PresenceCommand,
    now: DateTime<Utc>,
) -> Result<(DriverPresence, Vec<PresenceEffect>), AppError> {
    use PresenceStatus::{Busy, Offline, Online};

    let mut next = current.clone();
    let effects = match (current.status, command) {
        (
            Offline,
            PresenceCommand::GoOnline {
                location,
                permission_granted,
            },
        ) => {
            next.status = Online;
            next.location_permission_granted = permission_granted;
            if location.is_some() {
                next.last_known_location = location;
            }
            vec![PresenceEffect::StartLoops, PresenceEffect::Announce(Online)]
        }
        (Online | Busy, PresenceCommand::GoOnline { .. }) => Vec::new(),

        (Online, PresenceCommand::GoOffline) => {
            next.status = Offline;
            vec![PresenceEffect::StopLoops, PresenceEffect::Announce(Offline)]
        }
        (Offline, PresenceCommand::GoOffline) => Vec::new(),
        (Busy, PresenceCommand::GoOffline) => {
            return Err(AppError::InvalidPresenceTransition {
                from: Busy,
                to: Offline,
            });
        }

        (Online, PresenceCommand::SetBusy) => {
            next.status = Busy;
            vec![PresenceEffect::Announce(Busy)]
        }
        (Busy, PresenceCommand::SetBusy) => Vec::new(),
        (Offline, PresenceCommand::SetBusy) => {
            return Err(AppError::InvalidPresenceTransition {
                from: Offline,
                to: Busy,
            });
        }

        (Busy, PresenceCommand::SetAvailable) => {
            next.status = Online;
            vec![PresenceEffect::Announce(Online)]
        }
        (Online, PresenceCommand::SetAvailable) => Vec::new(),
        (Offline, PresenceCommand::SetAvailable) => {
            return Err(AppError::InvalidPresenceTransition {
                from: Offline,
                to: Online,
            });
        }
    };

    if !effects.is_empty() {
        next.updated_at = now;
    }
    Ok((next, effects))
}

/// Liveness bookkeeping kept on the monotonic clock.
#[derive(Debug, Default)]
struct Liveness {
    online_since: Option<Instant>,
    last_ack: Option<Instant>,
    consecutive_failures: u32,
    degraded: bool,
}

struct PresenceBook {
    presence: DriverPresence,
    liveness: Liveness,
    loops: Option<Loops>,
    /// Accepts in flight; going offline is refused while any is held.
    holds: u32,
    /// Offline requests waiting on the backend; new holds are refused.
    leaving: u32,
}

struct Loops {
    heartbeat: JoinHandle<()>,
    location: JoinHandle<()>,
}

impl Loops {
    fn stop(self) {
        self.heartbeat.abort();
        self.location.abort();
    }
}

#[derive(Clone)]
pub struct PresenceManager {
    inner: Arc<PresenceInner>,
}

struct PresenceInner {
    driver_id: Uuid,
    book: Mutex<PresenceBook>,
    repository: Arc<dyn OrderRepository>,
    transport: Arc<dyn RealtimeTransport>,
    location: Arc<dyn LocationProvider>,
    notifier: Notifier,
    metrics: Arc<Metrics>,
    config: SessionConfig,
}

impl PresenceManager {
    pub fn new(
        driver_id: Uuid,
        repository: Arc<dyn OrderRepository>,
        transport: Arc<dyn RealtimeTransport>,
        location: Arc<dyn LocationProvider>,
        notifier: Notifier,
        metrics: Arc<Metrics>,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PresenceInner {
                driver_id,
                book: Mutex::new(PresenceBook {
                    presence: DriverPresence::new(driver_id),
                    liveness: Liveness::default(),
                    loops: None,
                    holds: 0,
                    leaving: 0,
                }),
                repository,
                transport,
                location,
                notifier,
                metrics,
                config,
            }),
        }
    }

    pub fn snapshot(&self) -> DriverPresence {
        self.inner.lock().presence.clone()
    }

    pub fn status(&self) -> PresenceStatus {
        self.inner.lock().presence.status
    }

    pub fn loops_running(&self) -> bool {
        self.inner.lock().loops.is_some()
    }

    pub fn health(&self) -> PresenceHealth {
        let book = self.inner.lock();
        self.inner.health_of(&book)
    }

    pub async fn go_online(&self) -> Result<DriverPresence, AppError> {
        let inner = &self.inner;
        if inner.lock().presence.status.is_online() {
            return Ok(self.snapshot());
        }

        let permission_granted = inner.location.permission_granted();
        let location = if permission_granted {
            let fix = tokio::time::timeout(
                inner.config.location_timeout,
                inner.location.current_location(),
            )
            .await
            .ok()
            .flatten();
            if fix.is_none() {
                warn!(driver_id = %inner.driver_id, "no location fix, refusing to go online");
                return Err(AppError::LocationUnavailable);
            }
            fix
        } else {
            warn!(driver_id = %inner.driver_id, "going online without location permission");
            None
        };

        bounded(
            inner.config.request_timeout,
            "update_driver_state",
            inner
                .repository
                .update_driver_state(inner.driver_id, PresenceStatus::Online, location),
        )
        .await?;

        let command = PresenceCommand::GoOnline {
            location,
            permission_granted,
        };
        let effects = inner.apply(command)?;

        if effects.contains(&PresenceEffect::StartLoops) {
            inner
                .emit(OutboundEvent::JoinDriverRoom {
                    driver_id: inner.driver_id,
                })
                .await;
        }
        inner.announce(&effects).await;
        Ok(self.snapshot())
    }

    pub async fn go_offline(&self) -> Result<DriverPresence, AppError> {
        let inner = &self.inner;
        {
            let mut book = inner.lock();
            match book.presence.status {
                PresenceStatus::Offline => return Ok(book.presence.clone()),
                PresenceStatus::Busy => {
                    return Err(AppError::InvalidPresenceTransition {
                        from: PresenceStatus::Busy,
                        to: PresenceStatus::Offline,
                    });
                }
                PresenceStatus::Online if book.holds > 0 => {
                    debug!(driver_id = %inner.driver_id, "offline refused, accept in flight");
                    return Err(AppError::InvalidPresenceTransition {
                        from: PresenceStatus::Online,
                        to: PresenceStatus::Offline,
                    });
                }
                PresenceStatus::Online => book.leaving += 1,
            }
        }

        let applied = bounded(
            inner.config.request_timeout,
            "update_driver_state",
            inner
                .repository
                .update_driver_state(inner.driver_id, PresenceStatus::Offline, None),
        )
        .await
        .and_then(|()| inner.apply(PresenceCommand::GoOffline));

        // released only once the status is settled, so no hold slips in between
        {
            let mut book = inner.lock();
            book.leaving = book.leaving.saturating_sub(1);
        }

        let effects = applied?;
        inner.announce(&effects).await;
        Ok(self.snapshot())
    }

    /// Pins the driver ONLINE for the duration of an accept. Fails while the
    /// driver is not ONLINE or an offline request is under way.
    pub fn hold_online(&self) -> Result<PresenceHold, AppError> {
        let mut book = self.inner.lock();
        let status = book.presence.status;
        if status != PresenceStatus::Online || book.leaving > 0 {
            return Err(AppError::InvalidPresenceTransition {
                from: status,
                to: PresenceStatus::Busy,
            });
        }
        book.holds += 1;
        Ok(PresenceHold {
            inner: self.inner.clone(),
        })
    }

    pub async fn set_busy(&self) -> Result<DriverPresence, AppError> {
        let effects = self.inner.apply(PresenceCommand::SetBusy)?;
        self.inner.announce(&effects).await;
        Ok(self.snapshot())
    }

    pub async fn set_available(&self) -> Result<DriverPresence, AppError> {
        let effects = self.inner.apply(PresenceCommand::SetAvailable)?;
        self.inner.announce(&effects).await;
        Ok(self.snapshot())
    }

    /// Re-announces room membership and status after the transport came back.
    pub async fn resync(&self) {
        let status = self.status();
        if !status.is_online() {
            return;
        }
        let inner = &self.inner;
        inner
            .emit(OutboundEvent::JoinDriverRoom {
                driver_id: inner.driver_id,
            })
            .await;
        inner
            .emit(OutboundEvent::DriverStatusUpdate {
                status,
                timestamp: Utc::now(),
            })
            .await;
    }

    /// Session teardown: stops loops without touching the backend.
    pub fn shutdown(&self) {
        let loops = self.inner.lock().loops.take();
        if let Some(loops) = loops {
            loops.stop();
            debug!(driver_id = %self.inner.driver_id, "presence loops stopped");
        }
    }
}

/// Released on drop; see [`PresenceManager::hold_online`].
pub struct PresenceHold {
    inner: Arc<PresenceInner>,
}

impl Drop for PresenceHold {
    fn drop(&mut self) {
        let mut book = self.inner.lock();
        book.holds = book.holds.saturating_sub(1);
    }
}

impl PresenceInner {
    fn lock(&self) -> MutexGuard<'_, PresenceBook> {
        self.book
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn health_of(&self, book: &PresenceBook) -> PresenceHealth {
        let presence = &book.presence;
        let since = book.liveness.last_ack.or(book.liveness.online_since);
        let elapsed = since.map(|at| at.elapsed());

        PresenceHealth {
            status: presence.status,
            degraded: presence.status.is_online()
                && elapsed.is_some_and(|elapsed| elapsed > self.config.degraded_after),
            location_degraded: presence.is_location_degraded(),
            seconds_since_heartbeat: book.liveness.last_ack.map(|at| at.elapsed().as_secs()),
            consecutive_failures: book.liveness.consecutive_failures,
        }
    }

    /// Runs one transition under the lock and performs the loop effects.
    fn apply(self: &Arc<Self>, command: PresenceCommand) -> Result<Vec<PresenceEffect>, AppError> {
        let mut book = self.lock();
        let (next, effects) = transition(&book.presence, command, Utc::now())?;
        if effects.is_empty() {
            return Ok(effects);
        }

        let from = book.presence.status;
        book.presence = next;

        for effect in &effects {
            match effect {
                PresenceEffect::StartLoops => {
                    if book.loops.is_none() {
                        book.loops = Some(self.spawn_loops());
                    }
                    book.liveness = Liveness {
                        online_since: Some(Instant::now()),
                        ..Liveness::default()
                    };
                }
                PresenceEffect::StopLoops => {
                    if let Some(loops) = book.loops.take() {
                        loops.stop();
                    }
                    book.liveness = Liveness::default();
                }
                PresenceEffect::Announce(_) => {}
            }
        }

        info!(
            driver_id = %self.driver_id,
            from = from.as_str(),
            to = book.presence.status.as_str(),
            "presence changed"
        );
        self.notifier.publish(SessionEvent::PresenceChanged {
            presence: book.presence.clone(),
        });
        Ok(effects)
    }

    async fn announce(&self, effects: &[PresenceEffect]) {
        for effect in effects {
            if let PresenceEffect::Announce(status) = effect {
                self.emit(OutboundEvent::DriverStatusUpdate {
                    status: *status,
                    timestamp: Utc::now(),
                })
                .await;
            }
        }
    }

    async fn emit(&self, event: OutboundEvent) {
        if let Err(err) = self.transport.emit(event).await {
            warn!(driver_id = %self.driver_id, error = %err, "presence event not delivered");
        }
    }

    fn spawn_loops(self: &Arc<Self>) -> Loops {
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::downgrade(self),
            self.config.heartbeat_interval,
        ));
        let location = tokio::spawn(location_loop(
            Arc::downgrade(self),
            self.config.location_push_interval,
        ));
        Loops {
            heartbeat,
            location,
        }
    }

    async fn beat(&self) {
        let location = self.location.sample();
        let result = bounded(
            self.config.request_timeout,
            "send_heartbeat",
            self.repository.send_heartbeat(self.driver_id, location),
        )
        .await;

        match result {
            Ok(()) => {
                self.metrics
                    .heartbeats_total
                    .with_label_values(&["success"])
                    .inc();
                let acknowledged = {
                    let mut book = self.lock();
                    if !book.presence.status.is_online() {
                        false
                    } else {
                        book.presence.last_heartbeat_at = Some(Utc::now());
                        if location.is_some() {
                            book.presence.last_known_location = location;
                        }
                        book.liveness.last_ack = Some(Instant::now());
                        book.liveness.consecutive_failures = 0;
                        self.refresh_degraded(&mut book);
                        true
                    }
                };
                if acknowledged {
                    self.emit(OutboundEvent::DriverHeartbeat {
                        driver_id: self.driver_id,
                        timestamp: Utc::now(),
                    })
                    .await;
                }
            }
            Err(err) => {
                self.metrics
                    .heartbeats_total
                    .with_label_values(&["failure"])
                    .inc();
                {
                    let mut book = self.lock();
                    book.liveness.consecutive_failures += 1;
                    warn!(
                        driver_id = %self.driver_id,
                        failures = book.liveness.consecutive_failures,
                        error = %err,
                        "heartbeat failed"
                    );
                    self.refresh_degraded(&mut book);
                }
            }
        }
    }

    fn refresh_degraded(&self, book: &mut PresenceBook) {
        let health = self.health_of(book);
        if health.degraded != book.liveness.degraded {
            book.liveness.degraded = health.degraded;
            if health.degraded {
                warn!(driver_id = %self.driver_id, "presence degraded: heartbeats not acknowledged");
            } else {
                info!(driver_id = %self.driver_id, "presence healthy again");
            }
            self.notifier.publish(SessionEvent::HealthChanged { health });
        }
    }

    async fn push_location(&self) {
        let Some(point) = self.location.sample() else {
            debug!(driver_id = %self.driver_id, "no location fix to push");
            return;
        };

        {
            let mut book = self.lock();
            if !book.presence.status.is_online() {
                return;
            }
            book.presence.last_known_location = Some(point);
        }

        self.emit(OutboundEvent::DriverLocationUpdate {
            lat: point.lat,
            lng: point.lng,
            timestamp: Utc::now(),
        })
        .await;
    }
}

async fn heartbeat_loop(presence: std::sync::Weak<PresenceInner>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(presence) = presence.upgrade() else {
            return;
        };
        presence.beat().await;
    }
}

async fn location_loop(presence: std::sync::Weak<PresenceInner>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(presence) = presence.upgrade() else {
            return;
        };
        presence.push_location().await;
    }
}
