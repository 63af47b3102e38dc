//! Pipeline events delivered through the event bus and buffered in the outbox

use crate::domain::geofence::GeofenceAction;
use crate::domain::types::{ActivityType, LocationSample, MotionState, ProviderStatus};
use serde::{Deserialize, Serialize};

/// Subscription key: one per payload variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Location,
    MotionChange,
    ActivityChange,
    Geofence,
    ProviderChange,
    Http,
    ConnectivityChange,
    EnabledChange,
    PowerSaveChange,
    Heartbeat,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::Location,
        EventKind::MotionChange,
        EventKind::ActivityChange,
        EventKind::Geofence,
        EventKind::ProviderChange,
        EventKind::Http,
        EventKind::ConnectivityChange,
        EventKind::EnabledChange,
        EventKind::PowerSaveChange,
        EventKind::Heartbeat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Location => "location",
            EventKind::MotionChange => "motionchange",
            EventKind::ActivityChange => "activitychange",
            EventKind::Geofence => "geofence",
            EventKind::ProviderChange => "providerchange",
            EventKind::Http => "http",
            EventKind::ConnectivityChange => "connectivitychange",
            EventKind::EnabledChange => "enabledchange",
            EventKind::PowerSaveChange => "powersavechange",
            EventKind::Heartbeat => "heartbeat",
        }
    }

    /// Kinds that are buffered in the outbox for upload
    pub fn is_persisted(&self) -> bool {
        matches!(self, EventKind::Location | EventKind::MotionChange | EventKind::Geofence)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionChangePayload {
    pub state: MotionState,
    pub sample: LocationSample,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityChangePayload {
    pub activity: ActivityType,
    pub previous: ActivityType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofencePayload {
    pub identifier: String,
    pub action: GeofenceAction,
    pub sample: LocationSample,
}

/// Why the provider changed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderChangeReason {
    /// Provider reported a status update
    Status,
    /// No fix within the provider timeout
    Unavailable,
    /// A fix arrived after the provider was unavailable
    Recovered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderChangePayload {
    pub reason: ProviderChangeReason,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ProviderStatus>,
    /// Time since the last fix (ms), for unavailability reports
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silent_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpPayload {
    pub success: bool,
    /// HTTP status code, 0 when the request never completed
    pub status: u16,
    pub acked: usize,
    pub failed: usize,
    /// Entries dropped after exceeding the retention window
    #[serde(default)]
    pub evicted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HttpPayload {
    /// Summary for entries evicted after `max_days_to_persist`
    pub fn eviction_summary(evicted: usize, max_days: u32) -> Self {
        Self {
            success: false,
            status: 0,
            acked: 0,
            failed: 0,
            evicted,
            error: Some(format!("{evicted} record(s) exceeded max_days_to_persist={max_days}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_location: Option<LocationSample>,
    pub motion: MotionState,
}

/// Kind-specific event body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Location(LocationSample),
    MotionChange(MotionChangePayload),
    ActivityChange(ActivityChangePayload),
    Geofence(GeofencePayload),
    ProviderChange(ProviderChangePayload),
    Http(HttpPayload),
    ConnectivityChange { connected: bool },
    EnabledChange { enabled: bool },
    PowerSaveChange { is_power_save_mode: bool },
    Heartbeat(HeartbeatPayload),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Location(_) => EventKind::Location,
            EventPayload::MotionChange(_) => EventKind::MotionChange,
            EventPayload::ActivityChange(_) => EventKind::ActivityChange,
            EventPayload::Geofence(_) => EventKind::Geofence,
            EventPayload::ProviderChange(_) => EventKind::ProviderChange,
            EventPayload::Http(_) => EventKind::Http,
            EventPayload::ConnectivityChange { .. } => EventKind::ConnectivityChange,
            EventPayload::EnabledChange { .. } => EventKind::EnabledChange,
            EventPayload::PowerSaveChange { .. } => EventKind::PowerSaveChange,
            EventPayload::Heartbeat(_) => EventKind::Heartbeat,
        }
    }
}

/// A published event
///
/// Created by the event bus, which assigns `seq`; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number
    pub seq: u64,
    /// Publish time (epoch ms)
    pub created_at: u64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(seq: u64, created_at: u64, payload: EventPayload) -> Self {
        Self { seq, created_at, payload }
    }

    #[inline]
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}
