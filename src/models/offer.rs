use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::presence::GeoPoint;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Party {
    pub name: String,
    pub address: String,
    pub location: Option<GeoPoint>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderItem {
    pub name: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

/// Order summary captured when the offer was made. Never re-fetched while the
/// offer is on screen.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OfferSnapshot {
    pub restaurant: Party,
    pub customer: Party,
    pub items: Vec<OrderItem>,
    pub subtotal_cents: i64,
    pub delivery_fee_cents: i64,
    pub total_cents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignmentOffer {
    pub assignment_id: Uuid,
    pub order_id: Uuid,
    /// `None` marks a pool offer that has no countdown.
    pub expires_at: Option<DateTime<Utc>>,
    pub wave: u32,
    pub snapshot: OfferSnapshot,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferOutcome {
    Accepted,
    Declined,
    Expired,
    Cancelled,
    AcceptedByOther,
}

impl OfferOutcome {
    pub fn as_label(self) -> &'static str {
        match self {
            OfferOutcome::Accepted => "accepted",
            OfferOutcome::Declined => "declined",
            OfferOutcome::Expired => "expired",
            OfferOutcome::Cancelled => "cancelled",
            OfferOutcome::AcceptedByOther => "accepted_by_other",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferState {
    Pending,
    /// An accept request is in flight; only its response may resolve the offer.
    Accepting,
    Resolved { outcome: OfferOutcome },
}

impl OfferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, OfferState::Resolved { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeclineReason {
    TooFar,
    LowPayout,
    VehicleIssue,
    OnBreak,
    Other,
}

impl DeclineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeclineReason::TooFar => "too_far",
            DeclineReason::LowPayout => "low_payout",
            DeclineReason::VehicleIssue => "vehicle_issue",
            DeclineReason::OnBreak => "on_break",
            DeclineReason::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvedOffer {
    pub assignment_id: Uuid,
    pub order_id: Uuid,
    pub outcome: OfferOutcome,
    pub resolved_at: DateTime<Utc>,
}

/// What the driver's client currently shows for the offer slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OfferView {
    pub offer: AssignmentOffer,
    #[serde(flatten)]
    pub state: OfferState,
    pub seconds_remaining: Option<u64>,
}
