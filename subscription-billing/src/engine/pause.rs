//! Pause/resume evaluator.
//!
//! Decides, from the subscription's status, its pause summary and the pause
//! record, whether a scheduled pause activates, an active pause resumes, or
//! the cycle proceeds untouched. The returned records are what the caller
//! persists; nothing is written here.
//!
//! Writers persist the pause record before the subscription. A retry that
//! finds the pause record one step ahead of the subscription re-derives the
//! same transition from the pause record, so a half-applied transition is
//! completed instead of applied twice.

use crate::models::{PauseMode, PauseStatus, Subscription, SubscriptionPause, SubscriptionStatus};
use chrono::{DateTime, Duration, Utc};
use service_core::error::AppError;

/// Outcome of evaluating a subscription's pause state.
#[derive(Debug, Clone, PartialEq)]
pub enum PauseDecision {
    /// No pause transition; bill normally.
    Continue,
    /// The pause became active; persist both records and skip this cycle.
    Activate {
        subscription: Subscription,
        pause: SubscriptionPause,
    },
    /// The pause completed; persist both records and bill with the extended period.
    Resume {
        subscription: Subscription,
        pause: SubscriptionPause,
        extension: Duration,
    },
    /// Subscription stays paused; skip this cycle.
    Skip,
}

impl PauseDecision {
    pub fn should_skip(&self) -> bool {
        matches!(self, PauseDecision::Activate { .. } | PauseDecision::Skip)
    }
}

/// Evaluate pause activation and auto-resume at `now`.
///
/// `pause` is the record referenced by `active_pause_id`, if any.
pub fn evaluate_pause(
    subscription: &Subscription,
    pause: Option<&SubscriptionPause>,
    now: DateTime<Utc>,
) -> Result<PauseDecision, AppError> {
    match (subscription.status(), subscription.pause_status()) {
        (SubscriptionStatus::Active | SubscriptionStatus::Trialing, PauseStatus::Scheduled) => {
            let pause = require_pause(subscription, pause)?;
            match pause.status() {
                PauseStatus::Active => Ok(activate(subscription, pause, now)),
                PauseStatus::Scheduled if activation_due(subscription, pause, now) => {
                    Ok(activate(subscription, pause, now))
                }
                _ => Ok(PauseDecision::Continue),
            }
        }
        (SubscriptionStatus::Paused, PauseStatus::Active) => {
            let pause = require_pause(subscription, pause)?;
            if pause.status() == PauseStatus::Completed {
                let resumed_at = pause.resumed_at.unwrap_or(now);
                return Ok(resume(subscription, pause, resumed_at, now));
            }
            match pause.pause_end {
                Some(pause_end) if now >= pause_end => {
                    Ok(resume(subscription, pause, pause_end, now))
                }
                _ => Ok(PauseDecision::Skip),
            }
        }
        (SubscriptionStatus::Paused, _) => Ok(PauseDecision::Skip),
        _ => Ok(PauseDecision::Continue),
    }
}

fn require_pause<'a>(
    subscription: &Subscription,
    pause: Option<&'a SubscriptionPause>,
) -> Result<&'a SubscriptionPause, AppError> {
    pause.ok_or_else(|| {
        AppError::BadRequest(anyhow::anyhow!(
            "subscription {} has pause status {} but no pause record",
            subscription.subscription_id,
            subscription.pause_status
        ))
    })
}

fn activation_due(
    subscription: &Subscription,
    pause: &SubscriptionPause,
    now: DateTime<Utc>,
) -> bool {
    match pause.mode() {
        PauseMode::PeriodEnd => now >= subscription.current_period_end,
        PauseMode::Scheduled | PauseMode::Immediate => now >= pause.pause_start,
    }
}

fn activate(
    subscription: &Subscription,
    pause: &SubscriptionPause,
    now: DateTime<Utc>,
) -> PauseDecision {
    let mut pause = pause.clone();
    if pause.status() != PauseStatus::Active {
        pause.set_status(PauseStatus::Active);
        pause.updated_utc = now;
    }

    let mut subscription = subscription.clone();
    subscription.set_status(SubscriptionStatus::Paused);
    subscription.set_pause_status(PauseStatus::Active);
    subscription.updated_utc = now;

    PauseDecision::Activate {
        subscription,
        pause,
    }
}

/// The pause ends at `resumed_at`: the scheduled end when the pause ran its
/// course, or the recorded resume time when a previous attempt already
/// completed the pause record. The extended period never runs past `end_date`.
fn resume(
    subscription: &Subscription,
    pause: &SubscriptionPause,
    resumed_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> PauseDecision {
    let extension = (resumed_at - pause.pause_start).max(Duration::zero());

    let mut pause = pause.clone();
    if pause.status() != PauseStatus::Completed {
        pause.set_status(PauseStatus::Completed);
        pause.resumed_at = Some(resumed_at);
        pause.updated_utc = now;
    }

    let mut subscription = subscription.clone();
    subscription.set_status(SubscriptionStatus::Active);
    subscription.set_pause_status(PauseStatus::None);
    subscription.active_pause_id = None;
    subscription.current_period_end = extended_period_end(&subscription, extension);
    subscription.updated_utc = now;

    PauseDecision::Resume {
        subscription,
        pause,
        extension,
    }
}

fn extended_period_end(subscription: &Subscription, extension: Duration) -> DateTime<Utc> {
    let extended = subscription.current_period_end + extension;
    match subscription.end_date {
        Some(end_date) => extended.min(end_date.max(subscription.current_period_end)),
        None => extended,
    }
}
