//! Retry with exponential backoff for fallible async steps.
//!
//! Each billing step runs under a [`RetryPolicy`]. Errors decide for
//! themselves whether another attempt is worthwhile via [`Retryable`].

use crate::error::AppError;
use rand::Rng;
use serde::Deserialize;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Classification hook for errors passed through [`retry_with_policy`].
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for AppError {
    fn is_retryable(&self) -> bool {
        AppError::is_retryable(self)
    }
}

/// Backoff schedule for one class of step.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to each delay.
    pub add_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::internal()
    }
}

impl RetryPolicy {
    /// Fast internal steps (storage reads and writes).
    pub fn internal() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Slow calls into external vendors and payment gateways.
    pub fn external_vendor() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::internal()
        }
    }

    /// Delay after the given zero-based failed attempt.
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let backoff =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff_ms = backoff.min(self.max_backoff.as_millis() as f64) as u64;

        let mut duration = Duration::from_millis(backoff_ms);

        if self.add_jitter && backoff_ms > 0 {
            let jitter = rand::thread_rng().gen_range(0.0..0.25);
            duration += Duration::from_millis((backoff_ms as f64 * jitter) as u64);
        }

        duration
    }
}

/// Run `f` until it succeeds, fails permanently, or the policy is exhausted.
///
/// The last error is returned unchanged so callers keep its classification.
pub async fn retry_with_policy<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation: &str,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(result) => {
                if attempt > 0 {
                    info!(
                        operation = operation,
                        attempt = attempt + 1,
                        "Step succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if !err.is_retryable() {
                    warn!(
                        operation = operation,
                        error = %err,
                        "Step failed with permanent error, not retrying"
                    );
                    return Err(err);
                }

                if attempt + 1 >= max_attempts {
                    warn!(
                        operation = operation,
                        attempt = attempt + 1,
                        error = %err,
                        "Step failed after max attempts"
                    );
                    return Err(err);
                }

                let backoff = policy.backoff_duration(attempt);
                warn!(
                    operation = operation,
                    attempt = attempt + 1,
                    error = %err,
                    backoff_ms = backoff.as_millis() as u64,
                    "Step failed, retrying after backoff"
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
