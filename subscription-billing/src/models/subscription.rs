//! Subscription model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Draft,
    Trialing,
    Active,
    Paused,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Draft => "draft",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "draft" => SubscriptionStatus::Draft,
            "trialing" => SubscriptionStatus::Trialing,
            "paused" => SubscriptionStatus::Paused,
            "cancelled" => SubscriptionStatus::Cancelled,
            _ => SubscriptionStatus::Active,
        }
    }
}

/// Pause status, shared by the subscription summary and the pause record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseStatus {
    None,
    Scheduled,
    Active,
    Completed,
}

impl PauseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseStatus::None => "none",
            PauseStatus::Scheduled => "scheduled",
            PauseStatus::Active => "active",
            PauseStatus::Completed => "completed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "scheduled" => PauseStatus::Scheduled,
            "active" => PauseStatus::Active,
            "completed" => PauseStatus::Completed,
            _ => PauseStatus::None,
        }
    }
}

/// Recurrence unit of a subscription's billing periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCadence {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    HalfYearly,
    Annual,
}

impl BillingCadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCadence::Daily => "daily",
            BillingCadence::Weekly => "weekly",
            BillingCadence::Monthly => "monthly",
            BillingCadence::Quarterly => "quarterly",
            BillingCadence::HalfYearly => "half_yearly",
            BillingCadence::Annual => "annual",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "daily" => BillingCadence::Daily,
            "weekly" => BillingCadence::Weekly,
            "quarterly" => BillingCadence::Quarterly,
            "half_yearly" => BillingCadence::HalfYearly,
            "annual" => BillingCadence::Annual,
            _ => BillingCadence::Monthly,
        }
    }
}

/// Subscription.
///
/// `version` is bumped on every write; updates carrying a stale version are
/// rejected as conflicts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub tenant_id: Uuid,
    pub environment_id: Uuid,
    pub customer_id: Uuid,
    pub plan_id: Uuid,
    pub status: String,
    pub currency: String,
    pub billing_anchor: DateTime<Utc>,
    pub billing_cadence: String,
    pub billing_period_count: i32,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub cancel_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub pause_status: String,
    pub active_pause_id: Option<Uuid>,
    pub payment_method_id: Option<String>,
    pub published: bool,
    pub version: i64,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Subscription {
    pub fn status(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_string(&self.status)
    }

    pub fn set_status(&mut self, status: SubscriptionStatus) {
        self.status = status.as_str().to_string();
    }

    pub fn pause_status(&self) -> PauseStatus {
        PauseStatus::from_string(&self.pause_status)
    }

    pub fn set_pause_status(&mut self, status: PauseStatus) {
        self.pause_status = status.as_str().to_string();
    }

    pub fn cadence(&self) -> BillingCadence {
        BillingCadence::from_string(&self.billing_cadence)
    }
}

/// Recurring line item attached to a subscription, priced once per period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SubscriptionLineItem {
    pub line_item_id: Uuid,
    pub subscription_id: Uuid,
    pub price_id: Option<Uuid>,
    pub description: String,
    pub quantity: Decimal,
    pub unit_amount: Decimal,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl SubscriptionLineItem {
    /// Whether the line item is billable for a period starting at `period_start`.
    pub fn is_active_at(&self, period_start: DateTime<Utc>) -> bool {
        let started = self.start_date.map_or(true, |start| start <= period_start);
        let not_ended = self.end_date.map_or(true, |end| end > period_start);
        started && not_ended
    }
}
