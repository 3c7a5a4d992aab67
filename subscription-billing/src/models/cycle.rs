//! Billing period, cycle state and step log models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Contiguous `[start, end)` billing period. Never persisted on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BillingPeriod {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Billing cycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Running,
    Completed,
    Failed,
    Skipped,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Running => "running",
            CycleStatus::Completed => "completed",
            CycleStatus::Failed => "failed",
            CycleStatus::Skipped => "skipped",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "completed" => CycleStatus::Completed,
            "failed" => CycleStatus::Failed,
            "skipped" => CycleStatus::Skipped,
            _ => CycleStatus::Running,
        }
    }
}

/// Persisted record of one billing cycle execution for a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct CycleState {
    pub cycle_id: Uuid,
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    pub status: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub attempt: i32,
    pub invoices_created: i32,
    pub last_error: Option<String>,
    pub started_utc: DateTime<Utc>,
    pub completed_utc: Option<DateTime<Utc>>,
}

impl CycleState {
    pub fn status(&self) -> CycleStatus {
        CycleStatus::from_string(&self.status)
    }
}

/// Mutating steps recorded in the step log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStep {
    ActivatePause,
    ResumePause,
    MaterializeInvoice,
    AdvancePeriod,
    Cancel,
}

impl CycleStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStep::ActivatePause => "activate_pause",
            CycleStep::ResumePause => "resume_pause",
            CycleStep::MaterializeInvoice => "materialize_invoice",
            CycleStep::AdvancePeriod => "advance_period",
            CycleStep::Cancel => "cancel",
        }
    }
}

/// Idempotency key of a step: subscription, step name and period boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepKey {
    pub subscription_id: Uuid,
    pub step: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

impl StepKey {
    pub fn new(subscription_id: Uuid, step: CycleStep, period: BillingPeriod) -> Self {
        Self {
            subscription_id,
            step: step.as_str().to_string(),
            period_start: period.start,
            period_end: period.end,
        }
    }
}

/// Completed step with its recorded output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct StepRecord {
    pub subscription_id: Uuid,
    pub step: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub cycle_id: Uuid,
    pub invoice_id: Option<Uuid>,
    pub completed_utc: DateTime<Utc>,
}

impl StepRecord {
    pub fn new(key: &StepKey, cycle_id: Uuid, invoice_id: Option<Uuid>) -> Self {
        Self {
            subscription_id: key.subscription_id,
            step: key.step.clone(),
            period_start: key.period_start,
            period_end: key.period_end,
            cycle_id,
            invoice_id,
            completed_utc: Utc::now(),
        }
    }

    pub fn key(&self) -> StepKey {
        StepKey {
            subscription_id: self.subscription_id,
            step: self.step.clone(),
            period_start: self.period_start,
            period_end: self.period_end,
        }
    }
}
