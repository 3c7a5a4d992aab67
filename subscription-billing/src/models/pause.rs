//! Subscription pause model.

use super::PauseStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// How a pause becomes active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseMode {
    PeriodEnd,
    Scheduled,
    Immediate,
}

impl PauseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseMode::PeriodEnd => "period_end",
            PauseMode::Scheduled => "scheduled",
            PauseMode::Immediate => "immediate",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "period_end" => PauseMode::PeriodEnd,
            "immediate" => PauseMode::Immediate,
            _ => PauseMode::Scheduled,
        }
    }
}

/// A pause owned by one subscription through `active_pause_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SubscriptionPause {
    pub pause_id: Uuid,
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    pub pause_mode: String,
    pub pause_status: String,
    pub pause_start: DateTime<Utc>,
    pub pause_end: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl SubscriptionPause {
    pub fn mode(&self) -> PauseMode {
        PauseMode::from_string(&self.pause_mode)
    }

    pub fn status(&self) -> PauseStatus {
        PauseStatus::from_string(&self.pause_status)
    }

    pub fn set_status(&mut self, status: PauseStatus) {
        self.pause_status = status.as_str().to_string();
    }
}
