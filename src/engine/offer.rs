//! Single-slot assignment offer handling.
//!
//! ```text
//! PENDING --accept--> ACCEPTING --confirmed--> ACCEPTED
//!    |                    |------rejected---> ACCEPTED_BY_OTHER (or remote outcome)
//!    |                    +------failed-----> PENDING (or EXPIRED past deadline)
//!    +--decline / timer / remote--> DECLINED | EXPIRED | CANCELLED | ACCEPTED_BY_OTHER
//! ```
//!
//! Every trigger (driver call, countdown, transport event) goes through
//! [`OfferManager::apply`], so the terminal check and the transition happen
//! under one lock. Whichever trigger lands first wins; later ones get
//! [`AppError::StaleOffer`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::notify::Notifier;
use crate::error::AppError;
use crate::models::events::SessionEvent;
use crate::models::offer::{
    AssignmentOffer, DeclineReason, OfferOutcome, OfferState, OfferView, ResolvedOffer,
};
use crate::models::order::ActiveOrder;
use crate::observability::metrics::Metrics;
use crate::repository::{OrderRepository, bounded};

const RESOLVED_LEDGER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferEvent {
    AcceptRequested,
    AcceptConfirmed,
    AcceptRejected,
    AcceptFailed,
    DeclineRequested,
    TimerFired,
    RemoteExpired,
    RemoteCancelled,
    RemoteAcceptedByOther,
    ConnectionLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferEffect {
    RequestAccept,
    RequestDecline,
    CancelCountdown,
    Resolve(OfferOutcome),
}

/// State of the offer in the slot, plus what arrived while an accept was in
/// flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferMachine {
    pub state: OfferState,
    pub deadline_passed: bool,
    pub preempted_by: Option<OfferOutcome>,
}

impl OfferMachine {
    pub fn pending() -> Self {
        Self {
            state: OfferState::Pending,
            deadline_passed: false,
            preempted_by: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The offer already reached a terminal state, or the trigger lost a race.
    Stale,
    /// The event makes no sense in the current state.
    Invalid,
}

fn resolve(outcome: OfferOutcome) -> (OfferMachine, Vec<OfferEffect>) {
    (
        OfferMachine {
            state: OfferState::Resolved { outcome },
            deadline_passed: false,
            preempted_by: None,
        },
        vec![OfferEffect::CancelCountdown, OfferEffect::Resolve(outcome)],
    )
}

pub fn transition(
    machine: &OfferMachine,
    event: OfferEvent,
) -> Result<(OfferMachine, Vec<OfferEffect>), Rejection> {
    match machine.state {
        OfferState::Resolved { .. } => Err(Rejection::Stale),

        OfferState::Pending => match event {
            OfferEvent::AcceptRequested if machine.deadline_passed => Err(Rejection::Stale),
            OfferEvent::AcceptRequested => Ok((
                OfferMachine {
                    state: OfferState::Accepting,
                    ..*machine
                },
                vec![OfferEffect::RequestAccept],
            )),
            OfferEvent::DeclineRequested => {
                let (next, mut effects) = resolve(OfferOutcome::Declined);
                effects.push(OfferEffect::RequestDecline);
                Ok((next, effects))
            }
            OfferEvent::TimerFired | OfferEvent::RemoteExpired | OfferEvent::ConnectionLost => {
                Ok(resolve(OfferOutcome::Expired))
            }
            OfferEvent::RemoteCancelled => Ok(resolve(OfferOutcome::Cancelled)),
            OfferEvent::RemoteAcceptedByOther => Ok(resolve(OfferOutcome::AcceptedByOther)),
            OfferEvent::AcceptConfirmed | OfferEvent::AcceptRejected | OfferEvent::AcceptFailed => {
                Err(Rejection::Invalid)
            }
        },

        OfferState::Accepting => match event {
            OfferEvent::AcceptConfirmed => Ok(resolve(OfferOutcome::Accepted)),
            OfferEvent::AcceptRejected => Ok(resolve(
                machine.preempted_by.unwrap_or(OfferOutcome::AcceptedByOther),
            )),
            OfferEvent::AcceptFailed => match (machine.preempted_by, machine.deadline_passed) {
                (Some(outcome), _) => Ok(resolve(outcome)),
                (None, true) => Ok(resolve(OfferOutcome::Expired)),
                (None, false) => Ok((
                    OfferMachine {
                        state: OfferState::Pending,
                        ..*machine
                    },
                    Vec::new(),
                )),
            },
            // the in-flight response decides; remember what happened meanwhile
            OfferEvent::TimerFired => Ok((
                OfferMachine {
                    deadline_passed: true,
                    ..*machine
                },
                Vec::new(),
            )),
            OfferEvent::RemoteExpired => Ok(preempt(machine, OfferOutcome::Expired)),
            OfferEvent::RemoteCancelled => Ok(preempt(machine, OfferOutcome::Cancelled)),
            OfferEvent::RemoteAcceptedByOther => {
                Ok(preempt(machine, OfferOutcome::AcceptedByOther))
            }
            OfferEvent::ConnectionLost => Ok((*machine, Vec::new())),
            OfferEvent::AcceptRequested | OfferEvent::DeclineRequested => Err(Rejection::Stale),
        },
    }
}

fn preempt(machine: &OfferMachine, outcome: OfferOutcome) -> (OfferMachine, Vec<OfferEffect>) {
    (
        OfferMachine {
            preempted_by: machine.preempted_by.or(Some(outcome)),
            ..*machine
        },
        Vec::new(),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveDecision {
    Stored,
    SlotOccupied,
    NotOnline,
    ActiveOrderInProgress,
    AlreadyExpired,
    Duplicate,
}

impl ReceiveDecision {
    pub fn as_label(self) -> &'static str {
        match self {
            ReceiveDecision::Stored => "stored",
            ReceiveDecision::SlotOccupied => "slot_occupied",
            ReceiveDecision::NotOnline => "not_online",
            ReceiveDecision::ActiveOrderInProgress => "active_order",
            ReceiveDecision::AlreadyExpired => "already_expired",
            ReceiveDecision::Duplicate => "duplicate",
        }
    }
}

struct OfferEntry {
    offer: AssignmentOffer,
    machine: OfferMachine,
    deadline: Option<Instant>,
    countdown: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct OfferBook {
    slot: Option<OfferEntry>,
    resolved: VecDeque<ResolvedOffer>,
}

impl OfferBook {
    fn resolved_outcome(&self, assignment_id: Uuid) -> Option<OfferOutcome> {
        self.resolved
            .iter()
            .rev()
            .find(|resolved| resolved.assignment_id == assignment_id)
            .map(|resolved| resolved.outcome)
    }
}

#[derive(Clone)]
pub struct OfferManager {
    inner: Arc<OfferInner>,
}

struct OfferInner {
    driver_id: Uuid,
    book: Mutex<OfferBook>,
    repository: Arc<dyn OrderRepository>,
    notifier: Notifier,
    metrics: Arc<Metrics>,
    request_timeout: Duration,
}

impl OfferManager {
    pub fn new(
        driver_id: Uuid,
        repository: Arc<dyn OrderRepository>,
        notifier: Notifier,
        metrics: Arc<Metrics>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(OfferInner {
                driver_id,
                book: Mutex::new(OfferBook::default()),
                repository,
                notifier,
                metrics,
                request_timeout,
            }),
        }
    }

    /// Stores the offer and starts its countdown. The caller has already
    /// checked presence and the active order.
    pub fn receive(&self, offer: AssignmentOffer) -> ReceiveDecision {
        let inner = &self.inner;
        let mut book = inner.lock();

        if book.resolved_outcome(offer.assignment_id).is_some() {
            return inner.ignored(&offer, ReceiveDecision::Duplicate);
        }
        if let Some(entry) = &book.slot {
            let decision = if entry.offer.assignment_id == offer.assignment_id {
                ReceiveDecision::Duplicate
            } else {
                ReceiveDecision::SlotOccupied
            };
            return inner.ignored(&offer, decision);
        }

        let remaining = match offer.expires_at {
            Some(expires_at) => match (expires_at - Utc::now()).to_std() {
                Ok(remaining) if !remaining.is_zero() => Some(remaining),
                _ => return inner.ignored(&offer, ReceiveDecision::AlreadyExpired),
            },
            None => None,
        };

        let deadline = remaining.map(|remaining| Instant::now() + remaining);
        let timer = deadline.map(|deadline| {
            tokio::spawn(countdown(
                Arc::downgrade(inner),
                offer.assignment_id,
                deadline,
            ))
        });

        info!(
            driver_id = %inner.driver_id,
            assignment_id = %offer.assignment_id,
            order_id = %offer.order_id,
            wave = offer.wave,
            seconds = remaining.map(|r| r.as_secs()),
            "offer presented"
        );

        inner.notifier.publish(SessionEvent::OfferPresented {
            offer: offer.clone(),
            seconds_remaining: remaining.map(|r| r.as_secs()),
        });

        book.slot = Some(OfferEntry {
            offer,
            machine: OfferMachine::pending(),
            deadline,
            countdown: timer,
        });
        ReceiveDecision::Stored
    }

    pub fn record_ignored(&self, offer: &AssignmentOffer, decision: ReceiveDecision) {
        self.inner.ignored(offer, decision);
    }

    pub fn current(&self) -> Option<OfferView> {
        let book = self.inner.lock();
        book.slot.as_ref().map(|entry| OfferView {
            offer: entry.offer.clone(),
            state: entry.machine.state,
            seconds_remaining: entry
                .deadline
                .map(|deadline| deadline.saturating_duration_since(Instant::now()).as_secs()),
        })
    }

    pub fn has_open_offer(&self) -> bool {
        self.inner.lock().slot.is_some()
    }

    pub fn outcome_of(&self, assignment_id: Uuid) -> Option<OfferOutcome> {
        self.inner.lock().resolved_outcome(assignment_id)
    }

    pub fn resolved(&self) -> Vec<ResolvedOffer> {
        self.inner.lock().resolved.iter().cloned().collect()
    }

    /// Asks the repository for the order. The server decides who wins; a
    /// lost race comes back as [`AppError::AssignmentUnavailable`].
    pub async fn accept(&self, assignment_id: Uuid) -> Result<ActiveOrder, AppError> {
        let inner = &self.inner;
        inner.apply(assignment_id, OfferEvent::AcceptRequested)?;

        let started = Instant::now();
        let result = bounded(
            inner.request_timeout,
            "accept_assignment_offer",
            inner.repository.accept_assignment_offer(assignment_id),
        )
        .await;

        let label = match &result {
            Ok(_) => "accepted",
            Err(AppError::AssignmentUnavailable { .. }) => "unavailable",
            Err(_) => "failed",
        };
        inner
            .metrics
            .accept_latency_seconds
            .with_label_values(&[label])
            .observe(started.elapsed().as_secs_f64());

        match result {
            Ok(order) => {
                inner.apply(assignment_id, OfferEvent::AcceptConfirmed)?;
                Ok(order)
            }
            Err(AppError::AssignmentUnavailable { .. }) => {
                let outcome = inner.apply(assignment_id, OfferEvent::AcceptRejected)?;
                debug!(assignment_id = %assignment_id, outcome = ?outcome, "accept lost the race");
                Err(AppError::AssignmentUnavailable { assignment_id })
            }
            Err(err) => {
                warn!(assignment_id = %assignment_id, error = %err, "accept failed");
                let _ = inner.apply(assignment_id, OfferEvent::AcceptFailed);
                Err(err)
            }
        }
    }

    /// Declines locally first; the repository is told afterwards and a failed
    /// call is only logged since the server expires the offer anyway.
    pub async fn decline(&self, assignment_id: Uuid, reason: DeclineReason) -> Result<(), AppError> {
        let inner = &self.inner;
        inner.apply(assignment_id, OfferEvent::DeclineRequested)?;

        info!(assignment_id = %assignment_id, reason = reason.as_str(), "offer declined");
        if let Err(err) = bounded(
            inner.request_timeout,
            "decline_assignment_offer",
            inner.repository.decline_assignment_offer(assignment_id, reason),
        )
        .await
        {
            warn!(assignment_id = %assignment_id, error = %err, "decline not delivered to backend");
        }
        Ok(())
    }

    pub fn remote_expired(&self, assignment_id: Uuid) {
        let _ = self.inner.apply(assignment_id, OfferEvent::RemoteExpired);
    }

    pub fn remote_cancelled(&self, assignment_id: Uuid) {
        let _ = self.inner.apply(assignment_id, OfferEvent::RemoteCancelled);
    }

    pub fn remote_accepted_by_other(&self, assignment_id: Uuid) {
        let _ = self
            .inner
            .apply(assignment_id, OfferEvent::RemoteAcceptedByOther);
    }

    /// Drops trust in a pending offer after the connection was lost.
    pub fn invalidate_pending(&self) {
        let pending = {
            let book = self.inner.lock();
            book.slot
                .as_ref()
                .map(|entry| entry.offer.assignment_id)
        };
        if let Some(assignment_id) = pending {
            let _ = self.inner.apply(assignment_id, OfferEvent::ConnectionLost);
        }
    }

    /// Session teardown: stops the countdown and forgets the slot silently.
    pub fn shutdown(&self) {
        let entry = self.inner.lock().slot.take();
        if let Some(mut entry) = entry {
            if let Some(countdown) = entry.countdown.take() {
                countdown.abort();
            }
        }
    }
}

impl OfferInner {
    fn lock(&self) -> MutexGuard<'_, OfferBook> {
        self.book
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ignored(&self, offer: &AssignmentOffer, decision: ReceiveDecision) -> ReceiveDecision {
        self.metrics
            .offers_ignored_total
            .with_label_values(&[decision.as_label()])
            .inc();
        debug!(
            driver_id = %self.driver_id,
            assignment_id = %offer.assignment_id,
            reason = decision.as_label(),
            "offer ignored"
        );
        decision
    }

    /// The single entry point for every offer transition.
    fn apply(&self, assignment_id: Uuid, event: OfferEvent) -> Result<OfferState, AppError> {
        let mut book = self.lock();

        let matches = book
            .slot
            .as_ref()
            .is_some_and(|entry| entry.offer.assignment_id == assignment_id);
        if !matches {
            return if book.resolved_outcome(assignment_id).is_some() {
                Err(AppError::StaleOffer { assignment_id })
            } else {
                Err(AppError::NotFound(format!("offer {assignment_id} not found")))
            };
        }

        let Some(entry) = book.slot.as_mut() else {
            return Err(AppError::NotFound(format!("offer {assignment_id} not found")));
        };

        // a countdown that is due counts as fired, even if its task has not run yet
        if entry.deadline.is_some_and(|deadline| deadline <= Instant::now())
            && !entry.machine.deadline_passed
            && event != OfferEvent::TimerFired
        {
            if let Ok((next, effects)) = transition(&entry.machine, OfferEvent::TimerFired) {
                entry.machine = next;
                if !effects.is_empty() {
                    self.finish(&mut book, effects);
                    return Err(AppError::StaleOffer { assignment_id });
                }
            }
        }

        let Some(entry) = book.slot.as_mut() else {
            return Err(AppError::StaleOffer { assignment_id });
        };

        let (next, effects) = transition(&entry.machine, event).map_err(|rejection| {
            debug!(assignment_id = %assignment_id, event = ?event, rejection = ?rejection, "offer event rejected");
            match rejection {
                Rejection::Stale => AppError::StaleOffer { assignment_id },
                Rejection::Invalid => {
                    AppError::Conflict(format!("{event:?} not valid for offer {assignment_id}"))
                }
            }
        })?;

        entry.machine = next;
        self.finish(&mut book, effects);
        Ok(next.state)
    }

    fn finish(&self, book: &mut OfferBook, effects: Vec<OfferEffect>) {
        for effect in effects {
            match effect {
                OfferEffect::CancelCountdown => {
                    if let Some(countdown) = book.slot.as_mut().and_then(|e| e.countdown.take()) {
                        countdown.abort();
                    }
                }
                OfferEffect::Resolve(outcome) => {
                    let Some(entry) = book.slot.take() else {
                        continue;
                    };
                    let resolved = ResolvedOffer {
                        assignment_id: entry.offer.assignment_id,
                        order_id: entry.offer.order_id,
                        outcome,
                        resolved_at: Utc::now(),
                    };

                    info!(
                        driver_id = %self.driver_id,
                        assignment_id = %resolved.assignment_id,
                        outcome = outcome.as_label(),
                        "offer resolved"
                    );
                    self.metrics
                        .offers_total
                        .with_label_values(&[outcome.as_label()])
                        .inc();
                    self.notifier.publish(SessionEvent::OfferResolved {
                        assignment_id: resolved.assignment_id,
                        order_id: resolved.order_id,
                        outcome,
                    });

                    if book.resolved.len() == RESOLVED_LEDGER {
                        book.resolved.pop_front();
                    }
                    book.resolved.push_back(resolved);
                }
                // network calls run outside the lock, driven by the caller
                OfferEffect::RequestAccept | OfferEffect::RequestDecline => {}
            }
        }
    }
}

async fn countdown(offers: Weak<OfferInner>, assignment_id: Uuid, deadline: Instant) {
    tokio::time::sleep_until(deadline).await;
    if let Some(offers) = offers.upgrade() {
        match offers.apply(assignment_id, OfferEvent::TimerFired) {
            Ok(state) => debug!(assignment_id = %assignment_id, state = ?state, "offer countdown fired"),
            Err(err) => debug!(assignment_id = %assignment_id, error = %err, "countdown found offer settled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{OfferEffect, OfferEvent, OfferMachine, Rejection, transition};
    use crate::models::offer::{OfferOutcome, OfferState};

    fn accepting() -> OfferMachine {
        transition(&OfferMachine::pending(), OfferEvent::AcceptRequested)
            .unwrap()
            .0
    }

    fn outcome(machine: &OfferMachine) -> Option<OfferOutcome> {
        match machine.state {
            OfferState::Resolved { outcome } => Some(outcome),
            _ => None,
        }
    }

    #[test]
    fn decline_resolves_and_requests_backend_call() {
        let (next, effects) =
            transition(&OfferMachine::pending(), OfferEvent::DeclineRequested).unwrap();
        assert_eq!(outcome(&next), Some(OfferOutcome::Declined));
        assert!(effects.contains(&OfferEffect::RequestDecline));
        assert!(effects.contains(&OfferEffect::CancelCountdown));
    }

    #[test]
    fn terminal_state_rejects_everything() {
        let (expired, _) = transition(&OfferMachine::pending(), OfferEvent::TimerFired).unwrap();
        for event in [
            OfferEvent::AcceptRequested,
            OfferEvent::DeclineRequested,
            OfferEvent::TimerFired,
            OfferEvent::RemoteCancelled,
            OfferEvent::AcceptConfirmed,
        ] {
            assert_eq!(transition(&expired, event), Err(Rejection::Stale));
        }
    }

    #[test]
    fn timer_during_accept_defers_to_response() {
        let (waiting, effects) = transition(&accepting(), OfferEvent::TimerFired).unwrap();
        assert!(effects.is_empty());
        assert_eq!(waiting.state, OfferState::Accepting);

        let (accepted, _) = transition(&waiting, OfferEvent::AcceptConfirmed).unwrap();
        assert_eq!(outcome(&accepted), Some(OfferOutcome::Accepted));
    }

    #[test]
    fn failed_accept_after_deadline_expires() {
        let (waiting, _) = transition(&accepting(), OfferEvent::TimerFired).unwrap();
        let (next, _) = transition(&waiting, OfferEvent::AcceptFailed).unwrap();
        assert_eq!(outcome(&next), Some(OfferOutcome::Expired));
    }

    #[test]
    fn failed_accept_before_deadline_rolls_back_to_pending() {
        let (next, effects) = transition(&accepting(), OfferEvent::AcceptFailed).unwrap();
        assert_eq!(next.state, OfferState::Pending);
        assert!(effects.is_empty());
    }

    #[test]
    fn rejection_reports_remote_cancel_seen_in_flight() {
        let (cancelled, _) = transition(&accepting(), OfferEvent::RemoteCancelled).unwrap();
        let (next, _) = transition(&cancelled, OfferEvent::AcceptRejected).unwrap();
        assert_eq!(outcome(&next), Some(OfferOutcome::Cancelled));
    }

    #[test]
    fn rejection_without_hint_is_accepted_by_other() {
        let (next, _) = transition(&accepting(), OfferEvent::AcceptRejected).unwrap();
        assert_eq!(outcome(&next), Some(OfferOutcome::AcceptedByOther));
    }

    #[test]
    fn second_accept_while_in_flight_is_stale() {
        assert_eq!(
            transition(&accepting(), OfferEvent::AcceptRequested),
            Err(Rejection::Stale)
        );
        assert_eq!(
            transition(&accepting(), OfferEvent::DeclineRequested),
            Err(Rejection::Stale)
        );
    }

    #[test]
    fn response_without_request_is_invalid() {
        assert_eq!(
            transition(&OfferMachine::pending(), OfferEvent::AcceptConfirmed),
            Err(Rejection::Invalid)
        );
    }

    #[test]
    fn accept_after_deadline_is_stale() {
        let machine = OfferMachine {
            deadline_passed: true,
            ..OfferMachine::pending()
        };
        assert_eq!(
            transition(&machine, OfferEvent::AcceptRequested),
            Err(Rejection::Stale)
        );
    }
}
