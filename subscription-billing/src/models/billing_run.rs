//! Billing run model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Billing run type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingRunType {
    Scheduled,
    Manual,
}

impl BillingRunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingRunType::Scheduled => "scheduled",
            BillingRunType::Manual => "manual",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "manual" => BillingRunType::Manual,
            _ => BillingRunType::Scheduled,
        }
    }
}

/// Billing run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingRunStatus {
    Running,
    Completed,
    Failed,
}

impl BillingRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingRunStatus::Running => "running",
            BillingRunStatus::Completed => "completed",
            BillingRunStatus::Failed => "failed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "completed" => BillingRunStatus::Completed,
            "failed" => BillingRunStatus::Failed,
            _ => BillingRunStatus::Running,
        }
    }
}

/// One fleet scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct BillingRun {
    pub run_id: Uuid,
    pub run_type: String,
    pub status: String,
    pub batch_size: i32,
    pub started_utc: DateTime<Utc>,
    pub completed_utc: Option<DateTime<Utc>>,
    pub subscriptions_scanned: i32,
    pub subscriptions_enqueued: i32,
    pub subscriptions_deduplicated: i32,
    pub subscriptions_failed: i32,
    pub error_message: Option<String>,
}

impl BillingRun {
    pub fn status(&self) -> BillingRunStatus {
        BillingRunStatus::from_string(&self.status)
    }
}

/// Counters accumulated while a run scans the fleet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingRunCounts {
    pub scanned: i32,
    pub enqueued: i32,
    pub deduplicated: i32,
    pub failed: i32,
}

/// Per-subscription enqueue failure within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct BillingRunResult {
    pub result_id: Uuid,
    pub run_id: Uuid,
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    pub status: String,
    pub error_message: Option<String>,
    pub created_utc: DateTime<Utc>,
}
