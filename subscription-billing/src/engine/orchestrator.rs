//! Per-subscription billing orchestrator.
//!
//! One cycle runs `CheckDraft -> CheckPause -> CalculatePeriods ->
//! MaterializeInvoice (per elapsed period, with a cancellation check after
//! each) -> AdvancePeriod -> TriggerInvoiceProcessing`.
//!
//! Every cycle is recorded as a [`CycleState`]; mutating steps are recorded in
//! the step log so a retried cycle reuses their outputs instead of repeating
//! their effects. The period pointer only moves once every elapsed period has
//! been invoiced.

use crate::engine::cancellation::{apply_cancellation, evaluate_cancellation};
use crate::engine::materializer::InvoiceMaterializer;
use crate::engine::pause::{evaluate_pause, PauseDecision};
use crate::engine::period::{calculate_periods, PeriodCalculation, PeriodSchedule};
use crate::models::{
    BillingPeriod, CycleState, CycleStatus, CycleStep, InvoiceEvent, StepKey, StepRecord,
    Subscription, SubscriptionStatus,
};
use crate::services::metrics;
use crate::services::pricing::InvoiceCalculator;
use crate::services::queue::InvoiceQueue;
use crate::services::repository::{CycleStore, InvoiceStore, Stores, SubscriptionStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use service_core::error::AppError;
use service_core::retry::{retry_with_policy, RetryPolicy};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Why a cycle ended without billing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Draft,
    Unpublished,
    Cancelled,
    Paused,
    PauseActivated,
    NothingElapsed,
}

/// Downstream trigger accounting for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TriggerResult {
    pub triggered_count: usize,
    pub failed_count: usize,
    pub failed_invoice_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleOutcome {
    pub cycle_id: Uuid,
    pub subscription_id: Uuid,
    pub status: CycleStatus,
    pub skip_reason: Option<SkipReason>,
    pub periods_processed: usize,
    /// Finalized invoices for the elapsed periods, oldest first.
    pub invoice_ids: Vec<Uuid>,
    pub invoices_created: usize,
    pub current_period: Option<BillingPeriod>,
    pub cancelled: bool,
    pub trigger: TriggerResult,
}

impl CycleOutcome {
    fn skipped(cycle_id: Uuid, subscription_id: Uuid, reason: SkipReason) -> Self {
        Self {
            cycle_id,
            subscription_id,
            status: CycleStatus::Skipped,
            skip_reason: Some(reason),
            periods_processed: 0,
            invoice_ids: Vec::new(),
            invoices_created: 0,
            current_period: None,
            cancelled: false,
            trigger: TriggerResult::default(),
        }
    }
}

/// Result of the pause step.
enum PauseCheck {
    Proceed(Subscription),
    Skip(SkipReason),
}

pub struct BillingOrchestrator {
    subscriptions: Arc<dyn SubscriptionStore>,
    cycles: Arc<dyn CycleStore>,
    materializer: InvoiceMaterializer,
    queue: Arc<dyn InvoiceQueue>,
    policy: RetryPolicy,
}

impl BillingOrchestrator {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        invoices: Arc<dyn InvoiceStore>,
        cycles: Arc<dyn CycleStore>,
        calculator: Arc<dyn InvoiceCalculator>,
        queue: Arc<dyn InvoiceQueue>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            subscriptions,
            cycles,
            materializer: InvoiceMaterializer::new(invoices, calculator, policy.clone()),
            queue,
            policy,
        }
    }

    pub fn from_stores(
        stores: &Stores,
        calculator: Arc<dyn InvoiceCalculator>,
        queue: Arc<dyn InvoiceQueue>,
        policy: RetryPolicy,
    ) -> Self {
        Self::new(
            stores.subscriptions.clone(),
            stores.invoices.clone(),
            stores.cycles.clone(),
            calculator,
            queue,
            policy,
        )
    }

    /// Run one billing cycle for a subscription at `now`.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, subscription_id = %subscription_id))]
    pub async fn run_cycle(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, AppError> {
        let started = Instant::now();
        let tenant = tenant_id.to_string();

        let subscription = self
            .load_subscription(tenant_id, subscription_id)
            .await?;

        let previous = retry_with_policy(&self.policy, "latest_cycle", || {
            self.cycles.latest_cycle(subscription_id)
        })
        .await?;
        let attempt = match previous {
            Some(cycle) if cycle.status() == CycleStatus::Failed => cycle.attempt + 1,
            _ => 1,
        };

        let cycle = CycleState {
            cycle_id: Uuid::new_v4(),
            tenant_id,
            subscription_id,
            status: CycleStatus::Running.as_str().to_string(),
            period_start: subscription.current_period_start,
            period_end: subscription.current_period_end,
            attempt,
            invoices_created: 0,
            last_error: None,
            started_utc: Utc::now(),
            completed_utc: None,
        };
        let cycle = retry_with_policy(&self.policy, "create_cycle", || {
            self.cycles.create_cycle(&cycle)
        })
        .await?;

        match self.execute(&cycle, subscription, now).await {
            Ok(outcome) => {
                let invoices_created = outcome.invoices_created as i32;
                retry_with_policy(&self.policy, "complete_cycle", || {
                    self.cycles
                        .complete_cycle(cycle.cycle_id, outcome.status, invoices_created, None)
                })
                .await?;

                metrics::record_billing_cycle(
                    &tenant,
                    outcome.status.as_str(),
                    started.elapsed().as_secs_f64(),
                );
                info!(
                    cycle_id = %cycle.cycle_id,
                    status = outcome.status.as_str(),
                    skip_reason = ?outcome.skip_reason,
                    periods_processed = outcome.periods_processed,
                    invoices_created = outcome.invoices_created,
                    cancelled = outcome.cancelled,
                    "Billing cycle finished"
                );
                Ok(outcome)
            }
            Err(err) => {
                error!(
                    cycle_id = %cycle.cycle_id,
                    attempt = attempt,
                    error = %err,
                    "Billing cycle failed"
                );
                if let Err(e) = self
                    .cycles
                    .complete_cycle(cycle.cycle_id, CycleStatus::Failed, 0, Some(err.to_string()))
                    .await
                {
                    warn!(cycle_id = %cycle.cycle_id, error = %e, "Failed to record cycle failure");
                }
                metrics::record_billing_cycle(
                    &tenant,
                    CycleStatus::Failed.as_str(),
                    started.elapsed().as_secs_f64(),
                );
                metrics::record_error(err.kind(), "billing_cycle");
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        cycle: &CycleState,
        subscription: Subscription,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, AppError> {
        let subscription_id = subscription.subscription_id;

        // CheckDraft
        if let Some(reason) = inactive_reason(&subscription) {
            info!(reason = ?reason, "Subscription not billable, skipping cycle");
            return Ok(CycleOutcome::skipped(cycle.cycle_id, subscription_id, reason));
        }

        // CheckPause
        let subscription = match retry_with_policy(&self.policy, "check_pause", || {
            self.check_pause(cycle, subscription.tenant_id, subscription_id, now)
        })
        .await?
        {
            PauseCheck::Proceed(subscription) => subscription,
            PauseCheck::Skip(reason) => {
                return Ok(CycleOutcome::skipped(cycle.cycle_id, subscription_id, reason));
            }
        };

        // CalculatePeriods
        let current = BillingPeriod::new(
            subscription.current_period_start,
            subscription.current_period_end,
        );
        let calculation = calculate_periods(
            current,
            &PeriodSchedule::for_subscription(&subscription),
            now,
        )?;

        if !calculation.should_process() {
            // The pointer already sits on the end-date period; only the
            // cancellation is left to apply.
            if calculation.reached_end_date {
                if let Some(cancelled_at) = evaluate_cancellation(&subscription, current.end) {
                    return self
                        .cancel_at_end_date(cycle, &subscription, current, cancelled_at, now)
                        .await;
                }
            }
            return Ok(CycleOutcome::skipped(
                cycle.cycle_id,
                subscription_id,
                SkipReason::NothingElapsed,
            ));
        }

        info!(
            periods = calculation.periods.len(),
            reached_end_date = calculation.reached_end_date,
            has_more_periods = calculation.has_more_periods,
            "Calculated billing periods"
        );

        // MaterializeInvoice + CheckCancellation
        let mut invoice_ids = Vec::new();
        let mut invoices_created = 0;
        let mut periods_processed = 0;
        let mut cancellation = None;

        for period in calculation.elapsed() {
            let (invoice_id, created) = self
                .materialize_period(cycle, &subscription, *period)
                .await?;
            periods_processed += 1;
            if created {
                invoices_created += 1;
            }
            invoice_ids.extend(invoice_id);

            if let Some(cancelled_at) = evaluate_cancellation(&subscription, period.end) {
                info!(period = %period, cancelled_at = %cancelled_at, "Cancellation boundary reached");
                cancellation = Some((*period, cancelled_at));
                break;
            }
        }

        // AdvancePeriod
        let (target, cancellation) =
            resolve_target(&subscription, &calculation, cancellation)?;
        let subscription = retry_with_policy(&self.policy, "advance_period", || {
            self.advance_period(cycle, current, target, cancellation, now)
        })
        .await?;

        let tenant = subscription.tenant_id.to_string();
        metrics::record_periods_processed(&tenant, periods_processed as u64);
        if let Some(cancelled_at) = cancellation {
            metrics::record_cancellation(&tenant, cancellation_reason(&subscription, cancelled_at));
        }

        // TriggerInvoiceProcessing
        let trigger = self.trigger_invoice_processing(&subscription, &invoice_ids).await;

        Ok(CycleOutcome {
            cycle_id: cycle.cycle_id,
            subscription_id,
            status: CycleStatus::Completed,
            skip_reason: None,
            periods_processed,
            invoice_ids,
            invoices_created,
            current_period: Some(target),
            cancelled: cancellation.is_some(),
            trigger,
        })
    }

    async fn load_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Subscription, AppError> {
        retry_with_policy(&self.policy, "get_subscription", || {
            self.subscriptions.get_subscription(tenant_id, subscription_id)
        })
        .await?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("subscription {} not found", subscription_id))
        })
    }

    /// Cancel a subscription whose current period ends on its end date, without
    /// moving the pointer.
    async fn cancel_at_end_date(
        &self,
        cycle: &CycleState,
        subscription: &Subscription,
        current: BillingPeriod,
        cancelled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, AppError> {
        retry_with_policy(&self.policy, "advance_period", || {
            self.advance_period(cycle, current, current, Some(cancelled_at), now)
        })
        .await?;

        metrics::record_cancellation(
            &subscription.tenant_id.to_string(),
            cancellation_reason(subscription, cancelled_at),
        );
        info!(period = %current, cancelled_at = %cancelled_at, "End date reached, subscription cancelled");

        Ok(CycleOutcome {
            cycle_id: cycle.cycle_id,
            subscription_id: subscription.subscription_id,
            status: CycleStatus::Completed,
            skip_reason: None,
            periods_processed: 0,
            invoice_ids: Vec::new(),
            invoices_created: 0,
            current_period: Some(current),
            cancelled: true,
            trigger: TriggerResult::default(),
        })
    }

    /// Evaluate and persist pause transitions from a fresh read, so a
    /// conflicting writer is resolved by retrying this step.
    async fn check_pause(
        &self,
        cycle: &CycleState,
        tenant_id: Uuid,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<PauseCheck, AppError> {
        let subscription = self
            .subscriptions
            .get_subscription(tenant_id, subscription_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("subscription {} not found", subscription_id))
            })?;

        let stored_pause = match subscription.active_pause_id {
            Some(pause_id) => self.subscriptions.get_pause(tenant_id, pause_id).await?,
            None => None,
        };

        let tenant = tenant_id.to_string();
        match evaluate_pause(&subscription, stored_pause.as_ref(), now)? {
            PauseDecision::Continue => Ok(PauseCheck::Proceed(subscription)),
            PauseDecision::Skip => {
                info!("Subscription paused, skipping cycle");
                Ok(PauseCheck::Skip(SkipReason::Paused))
            }
            PauseDecision::Activate {
                subscription: paused,
                pause,
            } => {
                if stored_pause.as_ref().map(|p| &p.pause_status) != Some(&pause.pause_status) {
                    self.subscriptions.update_pause(&pause).await?;
                }
                self.subscriptions.update_subscription(&paused).await?;

                let period = BillingPeriod::new(
                    subscription.current_period_start,
                    subscription.current_period_end,
                );
                let key = StepKey::new(subscription_id, CycleStep::ActivatePause, period);
                self.cycles
                    .record_step(&StepRecord::new(&key, cycle.cycle_id, None))
                    .await?;

                metrics::record_pause_transition(&tenant, "activate");
                info!(pause_id = %pause.pause_id, "Pause activated");
                Ok(PauseCheck::Skip(SkipReason::PauseActivated))
            }
            PauseDecision::Resume {
                subscription: resumed,
                pause,
                extension,
            } => {
                if stored_pause.as_ref().map(|p| &p.pause_status) != Some(&pause.pause_status) {
                    self.subscriptions.update_pause(&pause).await?;
                }
                let resumed = self.subscriptions.update_subscription(&resumed).await?;

                let resumed_at = pause.resumed_at.unwrap_or(now);
                let key = StepKey::new(
                    subscription_id,
                    CycleStep::ResumePause,
                    BillingPeriod::new(pause.pause_start, resumed_at),
                );
                self.cycles
                    .record_step(&StepRecord::new(&key, cycle.cycle_id, None))
                    .await?;

                metrics::record_pause_transition(&tenant, "resume");
                info!(
                    pause_id = %pause.pause_id,
                    extension_secs = extension.num_seconds(),
                    current_period_end = %resumed.current_period_end,
                    "Pause completed, period extended"
                );
                Ok(PauseCheck::Proceed(resumed))
            }
        }
    }

    /// Invoice one elapsed period, reusing the step log when an earlier
    /// attempt already did.
    async fn materialize_period(
        &self,
        cycle: &CycleState,
        subscription: &Subscription,
        period: BillingPeriod,
    ) -> Result<(Option<Uuid>, bool), AppError> {
        let key = StepKey::new(
            subscription.subscription_id,
            CycleStep::MaterializeInvoice,
            period,
        );

        let recorded = retry_with_policy(&self.policy, "get_step", || self.cycles.get_step(&key))
            .await?;
        if let Some(record) = recorded {
            info!(period = %period, invoice_id = ?record.invoice_id, "Period already materialized");
            return Ok((record.invoice_id, false));
        }

        let materialized = match self.materializer.materialize(subscription, period).await {
            Ok(materialized) => materialized,
            Err(err) => {
                error!(period = %period, error = %err, "Failed to materialize invoice");
                metrics::record_invoice_materialized(
                    &subscription.tenant_id.to_string(),
                    "failed",
                );
                return Err(err);
            }
        };

        let record = StepRecord::new(&key, cycle.cycle_id, materialized.invoice_id());
        retry_with_policy(&self.policy, "record_step", || self.cycles.record_step(&record))
            .await?;

        Ok((materialized.invoice_id(), materialized.created()))
    }

    /// Move the period pointer from `from` to `target`, cancelling in the same
    /// write when due. Works from a fresh read; a pointer already at `target`
    /// means an earlier attempt got here.
    async fn advance_period(
        &self,
        cycle: &CycleState,
        from: BillingPeriod,
        target: BillingPeriod,
        cancellation: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Subscription, AppError> {
        let mut subscription = self
            .subscriptions
            .get_subscription(cycle.tenant_id, cycle.subscription_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "subscription {} not found",
                    cycle.subscription_id
                ))
            })?;

        let pointer = BillingPeriod::new(
            subscription.current_period_start,
            subscription.current_period_end,
        );
        let already_cancelled = subscription.status() == SubscriptionStatus::Cancelled;
        if pointer == target && (cancellation.is_none() || already_cancelled) {
            return Ok(subscription);
        }
        if pointer != from {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "subscription {} period moved to {} during cycle",
                cycle.subscription_id,
                pointer
            )));
        }

        subscription.current_period_start = target.start;
        subscription.current_period_end = target.end;
        subscription.updated_utc = now;
        if let Some(cancelled_at) = cancellation {
            apply_cancellation(&mut subscription, cancelled_at, now);
        }

        let subscription = self.subscriptions.update_subscription(&subscription).await?;

        let key = StepKey::new(cycle.subscription_id, CycleStep::AdvancePeriod, from);
        self.cycles
            .record_step(&StepRecord::new(&key, cycle.cycle_id, None))
            .await?;
        if cancellation.is_some() {
            let key = StepKey::new(cycle.subscription_id, CycleStep::Cancel, target);
            self.cycles
                .record_step(&StepRecord::new(&key, cycle.cycle_id, None))
                .await?;
        }

        info!(
            from = %from,
            to = %target,
            cancelled = cancellation.is_some(),
            "Advanced billing period"
        );
        Ok(subscription)
    }

    /// Publish one event per finalized invoice. Failures are counted and
    /// logged, never returned.
    async fn trigger_invoice_processing(
        &self,
        subscription: &Subscription,
        invoice_ids: &[Uuid],
    ) -> TriggerResult {
        let mut result = TriggerResult::default();

        for invoice_id in invoice_ids {
            let event = InvoiceEvent {
                invoice_id: *invoice_id,
                subscription_id: subscription.subscription_id,
                tenant_id: subscription.tenant_id,
                environment_id: subscription.environment_id,
            };
            match self.queue.publish(&event).await {
                Ok(()) => result.triggered_count += 1,
                Err(e) => {
                    warn!(invoice_id = %invoice_id, error = %e, "Failed to trigger invoice processing");
                    metrics::record_error(e.kind(), "trigger_invoice_processing");
                    result.failed_count += 1;
                    result.failed_invoice_ids.push(*invoice_id);
                }
            }
        }

        if result.failed_count > 0 {
            warn!(
                triggered_count = result.triggered_count,
                failed_count = result.failed_count,
                failed_invoice_ids = ?result.failed_invoice_ids,
                "Some invoices were not handed to downstream processing"
            );
        }

        result
    }
}

fn inactive_reason(subscription: &Subscription) -> Option<SkipReason> {
    match subscription.status() {
        SubscriptionStatus::Draft => Some(SkipReason::Draft),
        SubscriptionStatus::Cancelled => Some(SkipReason::Cancelled),
        _ if !subscription.published => Some(SkipReason::Unpublished),
        _ => None,
    }
}

fn cancellation_reason(subscription: &Subscription, cancelled_at: DateTime<Utc>) -> &'static str {
    if subscription.cancel_at == Some(cancelled_at) {
        "cancel_at_period_end"
    } else {
        "end_date"
    }
}

/// Where the pointer lands: the period holding the cancellation boundary when
/// one was hit mid-loop, otherwise the new current period (which gets its own
/// cancellation check).
fn resolve_target(
    subscription: &Subscription,
    calculation: &PeriodCalculation,
    cancellation: Option<(BillingPeriod, DateTime<Utc>)>,
) -> Result<(BillingPeriod, Option<DateTime<Utc>>), AppError> {
    if let Some((period, cancelled_at)) = cancellation {
        return Ok((period, Some(cancelled_at)));
    }

    let target = calculation.next_current().ok_or_else(|| {
        AppError::InternalError(anyhow::anyhow!("period calculation returned no periods"))
    })?;
    Ok((target, evaluate_cancellation(subscription, target.end)))
}
