//! Fleet scheduler.
//!
//! Scans subscriptions due for billing in `subscription_id` order, one batch
//! at a time, and hands each to the cycle executor. A failure to enqueue one
//! subscription is recorded and the scan moves on.

use crate::models::{BillingRun, BillingRunCounts, BillingRunStatus, BillingRunType};
use crate::services::metrics;
use crate::services::repository::{BillingRunStore, SubscriptionStore};
use crate::workers::executor::{CycleEnqueuer, CycleRequest, EnqueueResult};
use chrono::Utc;
use service_core::error::AppError;
use service_core::retry::{retry_with_policy, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

pub const DEFAULT_BATCH_SIZE: i64 = 100;

/// Batch sizes that are not positive fall back to [`DEFAULT_BATCH_SIZE`].
pub fn effective_batch_size(batch_size: i64) -> i64 {
    if batch_size <= 0 {
        DEFAULT_BATCH_SIZE
    } else {
        batch_size
    }
}

pub struct FleetScheduler {
    subscriptions: Arc<dyn SubscriptionStore>,
    runs: Arc<dyn BillingRunStore>,
    enqueuer: Arc<dyn CycleEnqueuer>,
    policy: RetryPolicy,
}

impl FleetScheduler {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        runs: Arc<dyn BillingRunStore>,
        enqueuer: Arc<dyn CycleEnqueuer>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            subscriptions,
            runs,
            enqueuer,
            policy,
        }
    }

    /// Run one full scan and return the finished billing run.
    #[instrument(skip(self), fields(run_type = run_type.as_str()))]
    pub async fn run_once(
        &self,
        run_type: BillingRunType,
        batch_size: i64,
    ) -> Result<BillingRun, AppError> {
        let batch_size = effective_batch_size(batch_size);
        let run = retry_with_policy(&self.policy, "create_billing_run", || {
            self.runs.create_billing_run(run_type, batch_size as i32)
        })
        .await?;

        info!(run_id = %run.run_id, batch_size = batch_size, "Billing run started");

        let mut counts = BillingRunCounts::default();
        let scan = self.scan(&run, batch_size, &mut counts).await;

        let (status, error_message) = match &scan {
            Ok(()) => (BillingRunStatus::Completed, None),
            Err(e) => (BillingRunStatus::Failed, Some(e.to_string())),
        };

        let finished = retry_with_policy(&self.policy, "update_billing_run", || {
            self.runs
                .update_billing_run(run.run_id, status, &counts, error_message.clone())
        })
        .await?
        .unwrap_or(run);

        metrics::record_billing_run(run_type.as_str(), status.as_str());
        info!(
            run_id = %finished.run_id,
            status = status.as_str(),
            scanned = counts.scanned,
            enqueued = counts.enqueued,
            deduplicated = counts.deduplicated,
            failed = counts.failed,
            "Billing run finished"
        );

        scan.map(|_| finished)
    }

    async fn scan(
        &self,
        run: &BillingRun,
        batch_size: i64,
        counts: &mut BillingRunCounts,
    ) -> Result<(), AppError> {
        let before = Utc::now();
        let mut cursor = None;

        loop {
            let batch = retry_with_policy(&self.policy, "list_active_subscriptions", || {
                self.subscriptions
                    .list_active_subscriptions(before, batch_size, cursor)
            })
            .await?;

            let Some(last) = batch.last() else {
                break;
            };
            cursor = Some(last.subscription_id);
            let batch_len = batch.len() as i64;

            for subscription in &batch {
                counts.scanned += 1;
                let request = CycleRequest {
                    tenant_id: subscription.tenant_id,
                    subscription_id: subscription.subscription_id,
                };

                match self.enqueuer.enqueue(request).await {
                    Ok(EnqueueResult::Enqueued) => {
                        counts.enqueued += 1;
                        metrics::record_scheduler_enqueue("enqueued");
                    }
                    Ok(EnqueueResult::Deduplicated) => {
                        counts.deduplicated += 1;
                        metrics::record_scheduler_enqueue("deduplicated");
                    }
                    Err(e) => {
                        counts.failed += 1;
                        metrics::record_scheduler_enqueue("failed");
                        warn!(
                            subscription_id = %subscription.subscription_id,
                            error = %e,
                            "Failed to enqueue billing cycle"
                        );
                        if let Err(record_err) = self
                            .runs
                            .create_billing_run_result(
                                run.run_id,
                                subscription.tenant_id,
                                subscription.subscription_id,
                                "failed",
                                Some(e.to_string()),
                            )
                            .await
                        {
                            warn!(error = %record_err, "Failed to record billing run result");
                        }
                    }
                }
            }

            if batch_len < batch_size {
                break;
            }
        }

        Ok(())
    }

    /// Run a scan every `interval` until `shutdown` is cancelled.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        batch_size: i64,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_secs = interval.as_secs(), "Fleet scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once(BillingRunType::Scheduled, batch_size).await {
                        error!(error = %e, "Scheduled billing run failed");
                        metrics::record_error(e.kind(), "billing_run");
                    }
                }
            }
        }

        info!("Fleet scheduler stopped");
    }
}
