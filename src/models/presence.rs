use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresenceStatus {
    Offline,
    Online,
    Busy,
}

impl PresenceStatus {
    pub fn is_online(self) -> bool {
        !matches!(self, PresenceStatus::Offline)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PresenceStatus::Offline => "OFFLINE",
            PresenceStatus::Online => "ONLINE",
            PresenceStatus::Busy => "BUSY",
        }
    }
}

/// Availability of one driver for the lifetime of a session.
///
/// Only the presence manager mutates this value; everything else reads clones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverPresence {
    pub driver_id: Uuid,
    pub status: PresenceStatus,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_known_location: Option<GeoPoint>,
    pub location_permission_granted: bool,
    pub updated_at: DateTime<Utc>,
}

impl DriverPresence {
    pub fn new(driver_id: Uuid) -> Self {
        Self {
            driver_id,
            status: PresenceStatus::Offline,
            last_heartbeat_at: None,
            last_known_location: None,
            location_permission_granted: false,
            updated_at: Utc::now(),
        }
    }

    /// Online without location permission: offers still arrive, but the
    /// dispatcher cannot rank this driver by distance.
    pub fn is_location_degraded(&self) -> bool {
        self.status.is_online() && !self.location_permission_granted
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceHealth {
    pub status: PresenceStatus,
    pub degraded: bool,
    pub location_degraded: bool,
    pub seconds_since_heartbeat: Option<u64>,
    pub consecutive_failures: u32,
}
