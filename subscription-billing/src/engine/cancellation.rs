//! Cancellation evaluator.

use crate::models::{Subscription, SubscriptionStatus};
use chrono::{DateTime, Utc};

/// Cancellation time for a subscription that reached `period_end`, if its
/// cancellation intent is due.
///
/// `cancel_at_period_end` with a `cancel_at` at or before the boundary wins
/// over an `end_date` that coincides with it. Already cancelled subscriptions
/// yield `None`.
pub fn evaluate_cancellation(
    subscription: &Subscription,
    period_end: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if subscription.status() == SubscriptionStatus::Cancelled {
        return None;
    }

    if subscription.cancel_at_period_end {
        if let Some(cancel_at) = subscription.cancel_at {
            if cancel_at <= period_end {
                return Some(cancel_at);
            }
        }
    }

    match subscription.end_date {
        Some(end_date) if end_date == period_end => Some(end_date),
        _ => None,
    }
}

/// Move the subscription to `cancelled`.
pub fn apply_cancellation(
    subscription: &mut Subscription,
    cancelled_at: DateTime<Utc>,
    now: DateTime<Utc>,
) {
    subscription.set_status(SubscriptionStatus::Cancelled);
    subscription.cancelled_at = Some(cancelled_at);
    subscription.updated_utc = now;
}
