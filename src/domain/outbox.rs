//! Outbox entries - persisted events awaiting upload

use crate::domain::event::Event;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upload lifecycle of an outbox entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    InFlight,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::InFlight => "IN_FLIGHT",
            DeliveryStatus::Failed => "FAILED",
        }
    }
}

/// One buffered event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub event: Event,
    pub status: DeliveryStatus,
    /// Enqueue time (epoch ms)
    pub created_at: u64,
    #[serde(default)]
    pub attempts: u32,
    /// Earliest retry time (epoch ms)
    #[serde(default)]
    pub next_attempt_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl OutboxEntry {
    pub fn new(event: Event, created_at: u64) -> Self {
        Self {
            id: Uuid::now_v7(),
            event,
            status: DeliveryStatus::Pending,
            created_at,
            attempts: 0,
            next_attempt_at: created_at,
            last_error: None,
        }
    }

    /// Whether a sync at `now_ms` may pick this entry up
    #[inline]
    pub fn is_due(&self, now_ms: u64) -> bool {
        matches!(self.status, DeliveryStatus::Pending | DeliveryStatus::Failed)
            && self.next_attempt_at <= now_ms
    }

    #[inline]
    pub fn is_in_flight(&self) -> bool {
        self.status == DeliveryStatus::InFlight
    }

    /// Older than the retention window at `now_ms`
    #[inline]
    pub fn is_expired(&self, now_ms: u64, max_age_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at) > max_age_ms
    }
}
