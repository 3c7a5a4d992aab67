//! In-memory store used by tests and by `STORE_BACKEND=memory` local runs.

use crate::models::{
    BillingPeriod, BillingRun, BillingRunCounts, BillingRunResult, BillingRunStatus,
    BillingRunType, CycleState, CycleStatus, DraftInvoice, Invoice, InvoiceLineItem,
    InvoiceStatus, PaymentStatus, StepKey, StepRecord, Subscription, SubscriptionLineItem,
    SubscriptionPause,
};
use crate::services::repository::{
    format_invoice_number, not_found, stale_version, BillingRunStore, CycleStore, InvoiceStore,
    SubscriptionStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default, Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    subscriptions: RwLock<HashMap<Uuid, Subscription>>,
    pauses: RwLock<HashMap<Uuid, SubscriptionPause>>,
    subscription_line_items: RwLock<HashMap<Uuid, Vec<SubscriptionLineItem>>>,
    invoices: RwLock<InvoiceTables>,
    cycles: RwLock<HashMap<Uuid, CycleState>>,
    steps: RwLock<HashMap<StepKey, StepRecord>>,
    runs: RwLock<HashMap<Uuid, BillingRun>>,
    run_results: RwLock<Vec<BillingRunResult>>,
}

#[derive(Default)]
struct InvoiceTables {
    invoices: HashMap<Uuid, Invoice>,
    line_items: HashMap<Uuid, Vec<InvoiceLineItem>>,
    sequences: HashMap<Uuid, i64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_subscription(&self, subscription: Subscription) {
        self.inner
            .subscriptions
            .write()
            .await
            .insert(subscription.subscription_id, subscription);
    }

    pub async fn insert_pause(&self, pause: SubscriptionPause) {
        self.inner.pauses.write().await.insert(pause.pause_id, pause);
    }

    pub async fn insert_line_item(&self, item: SubscriptionLineItem) {
        self.inner
            .subscription_line_items
            .write()
            .await
            .entry(item.subscription_id)
            .or_default()
            .push(item);
    }

    /// Invoices of one subscription, oldest period first.
    pub async fn invoices_for_subscription(&self, subscription_id: Uuid) -> Vec<Invoice> {
        let tables = self.inner.invoices.read().await;
        let mut invoices: Vec<Invoice> = tables
            .invoices
            .values()
            .filter(|invoice| invoice.subscription_id == subscription_id)
            .cloned()
            .collect();
        invoices.sort_by_key(|invoice| invoice.period_start);
        invoices
    }

    /// Cycles of one subscription, oldest first.
    pub async fn cycles_for_subscription(&self, subscription_id: Uuid) -> Vec<CycleState> {
        let cycles = self.inner.cycles.read().await;
        let mut found: Vec<CycleState> = cycles
            .values()
            .filter(|cycle| cycle.subscription_id == subscription_id)
            .cloned()
            .collect();
        found.sort_by_key(|cycle| cycle.started_utc);
        found
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn get_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        Ok(self
            .inner
            .subscriptions
            .read()
            .await
            .get(&subscription_id)
            .filter(|sub| sub.tenant_id == tenant_id)
            .cloned())
    }

    async fn update_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<Subscription, AppError> {
        let mut subscriptions = self.inner.subscriptions.write().await;
        let stored = subscriptions
            .get_mut(&subscription.subscription_id)
            .filter(|sub| sub.tenant_id == subscription.tenant_id)
            .ok_or_else(|| not_found("subscription", subscription.subscription_id))?;

        if stored.version != subscription.version {
            return Err(stale_version(
                "subscription",
                subscription.subscription_id,
                subscription.version,
            ));
        }

        let mut updated = subscription.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn get_pause(
        &self,
        tenant_id: Uuid,
        pause_id: Uuid,
    ) -> Result<Option<SubscriptionPause>, AppError> {
        Ok(self
            .inner
            .pauses
            .read()
            .await
            .get(&pause_id)
            .filter(|pause| pause.tenant_id == tenant_id)
            .cloned())
    }

    async fn update_pause(&self, pause: &SubscriptionPause) -> Result<SubscriptionPause, AppError> {
        let mut pauses = self.inner.pauses.write().await;
        let stored = pauses
            .get_mut(&pause.pause_id)
            .filter(|stored| stored.tenant_id == pause.tenant_id)
            .ok_or_else(|| not_found("pause", pause.pause_id))?;

        if stored.version != pause.version {
            return Err(stale_version("pause", pause.pause_id, pause.version));
        }

        let mut updated = pause.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn list_active_subscriptions(
        &self,
        before: DateTime<Utc>,
        batch_size: i64,
        after: Option<Uuid>,
    ) -> Result<Vec<Subscription>, AppError> {
        let subscriptions = self.inner.subscriptions.read().await;
        let pauses = self.inner.pauses.read().await;
        let mut due: Vec<Subscription> = subscriptions
            .values()
            .filter(|sub| after.map_or(true, |cursor| sub.subscription_id > cursor))
            .filter(|sub| {
                let pause = sub.active_pause_id.and_then(|id| pauses.get(&id));
                is_schedulable(sub, pause, before)
            })
            .cloned()
            .collect();
        due.sort_by_key(|sub| sub.subscription_id);
        due.truncate(batch_size.max(0) as usize);
        Ok(due)
    }

    async fn list_line_items(
        &self,
        _tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionLineItem>, AppError> {
        Ok(self
            .inner
            .subscription_line_items
            .read()
            .await
            .get(&subscription_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Same predicate as the PostgreSQL scheduler query. Pauses are only picked
/// up once a transition is due; a missing pause record is picked up so the
/// cycle reports it.
fn is_schedulable(
    subscription: &Subscription,
    pause: Option<&SubscriptionPause>,
    before: DateTime<Utc>,
) -> bool {
    if !subscription.published {
        return false;
    }
    match subscription.status.as_str() {
        "active" | "trialing" => {
            subscription.current_period_end <= before
                || (subscription.pause_status == "scheduled"
                    && pause.map_or(true, |p| {
                        p.pause_status != "scheduled"
                            || (p.pause_mode != "period_end" && p.pause_start <= before)
                    }))
        }
        "paused" => {
            subscription.pause_status == "active"
                && pause.map_or(true, |p| {
                    p.pause_status == "completed" || p.pause_end.is_some_and(|end| end <= before)
                })
        }
        _ => false,
    }
}

#[async_trait]
impl InvoiceStore for InMemoryStore {
    async fn create_invoice(&self, draft: &DraftInvoice) -> Result<Invoice, AppError> {
        let mut tables = self.inner.invoices.write().await;

        if let Some(existing) = tables.invoices.values().find(|invoice| {
            invoice.subscription_id == draft.subscription_id
                && invoice.period_start == draft.period_start
                && invoice.period_end == draft.period_end
        }) {
            return Ok(existing.clone());
        }

        let now = Utc::now();
        let subtotal = draft.subtotal();
        let invoice = Invoice {
            invoice_id: Uuid::new_v4(),
            tenant_id: draft.tenant_id,
            environment_id: draft.environment_id,
            subscription_id: draft.subscription_id,
            customer_id: draft.customer_id,
            invoice_number: None,
            status: InvoiceStatus::Draft.as_str().to_string(),
            payment_status: PaymentStatus::Pending.as_str().to_string(),
            currency: draft.currency.clone(),
            subtotal,
            amount_due: subtotal,
            amount_paid: Decimal::ZERO,
            period_start: draft.period_start,
            period_end: draft.period_end,
            vendor_synced_utc: None,
            finalized_utc: None,
            created_utc: now,
            updated_utc: now,
        };

        let line_items = draft
            .line_items
            .iter()
            .map(|item| InvoiceLineItem {
                line_item_id: Uuid::new_v4(),
                invoice_id: invoice.invoice_id,
                price_id: item.price_id,
                description: item.description.clone(),
                quantity: item.quantity,
                unit_amount: item.unit_amount,
                amount: item.amount,
            })
            .collect();

        tables.line_items.insert(invoice.invoice_id, line_items);
        tables.invoices.insert(invoice.invoice_id, invoice.clone());
        Ok(invoice)
    }

    async fn finalize_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Invoice, AppError> {
        let mut tables = self.inner.invoices.write().await;
        let tables = &mut *tables;

        let invoice = tables
            .invoices
            .get_mut(&invoice_id)
            .filter(|invoice| invoice.tenant_id == tenant_id)
            .ok_or_else(|| not_found("invoice", invoice_id))?;

        match invoice.status() {
            InvoiceStatus::Finalized => return Ok(invoice.clone()),
            InvoiceStatus::Void => {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "invoice {} is void and cannot be finalized",
                    invoice_id
                )))
            }
            InvoiceStatus::Draft => {}
        }

        let sequence = tables.sequences.entry(tenant_id).or_insert(0);
        *sequence += 1;

        let now = Utc::now();
        invoice.invoice_number = Some(format_invoice_number(*sequence));
        invoice.status = InvoiceStatus::Finalized.as_str().to_string();
        invoice.finalized_utc = Some(now);
        invoice.updated_utc = now;
        Ok(invoice.clone())
    }

    async fn get_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        Ok(self
            .inner
            .invoices
            .read()
            .await
            .invoices
            .get(&invoice_id)
            .filter(|invoice| invoice.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_invoice_for_period(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        period: BillingPeriod,
    ) -> Result<Option<Invoice>, AppError> {
        Ok(self
            .inner
            .invoices
            .read()
            .await
            .invoices
            .values()
            .find(|invoice| {
                invoice.tenant_id == tenant_id
                    && invoice.subscription_id == subscription_id
                    && invoice.period_start == period.start
                    && invoice.period_end == period.end
            })
            .cloned())
    }

    async fn get_invoice_line_items(
        &self,
        invoice_id: Uuid,
    ) -> Result<Vec<InvoiceLineItem>, AppError> {
        Ok(self
            .inner
            .invoices
            .read()
            .await
            .line_items
            .get(&invoice_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_vendor_synced(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Invoice, AppError> {
        let mut tables = self.inner.invoices.write().await;
        let invoice = tables
            .invoices
            .get_mut(&invoice_id)
            .filter(|invoice| invoice.tenant_id == tenant_id)
            .ok_or_else(|| not_found("invoice", invoice_id))?;

        let now = Utc::now();
        invoice.vendor_synced_utc.get_or_insert(now);
        invoice.updated_utc = now;
        Ok(invoice.clone())
    }

    async fn record_payment(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        status: PaymentStatus,
        amount_paid: Decimal,
    ) -> Result<Invoice, AppError> {
        let mut tables = self.inner.invoices.write().await;
        let invoice = tables
            .invoices
            .get_mut(&invoice_id)
            .filter(|invoice| invoice.tenant_id == tenant_id)
            .ok_or_else(|| not_found("invoice", invoice_id))?;

        invoice.payment_status = status.as_str().to_string();
        invoice.amount_paid += amount_paid;
        invoice.updated_utc = Utc::now();
        Ok(invoice.clone())
    }
}

#[async_trait]
impl CycleStore for InMemoryStore {
    async fn latest_cycle(&self, subscription_id: Uuid) -> Result<Option<CycleState>, AppError> {
        Ok(self
            .inner
            .cycles
            .read()
            .await
            .values()
            .filter(|cycle| cycle.subscription_id == subscription_id)
            .max_by_key(|cycle| cycle.started_utc)
            .cloned())
    }

    async fn create_cycle(&self, cycle: &CycleState) -> Result<CycleState, AppError> {
        self.inner
            .cycles
            .write()
            .await
            .insert(cycle.cycle_id, cycle.clone());
        Ok(cycle.clone())
    }

    async fn complete_cycle(
        &self,
        cycle_id: Uuid,
        status: CycleStatus,
        invoices_created: i32,
        last_error: Option<String>,
    ) -> Result<CycleState, AppError> {
        let mut cycles = self.inner.cycles.write().await;
        let cycle = cycles
            .get_mut(&cycle_id)
            .ok_or_else(|| not_found("billing cycle", cycle_id))?;

        cycle.status = status.as_str().to_string();
        cycle.invoices_created = invoices_created;
        cycle.last_error = last_error;
        cycle.completed_utc = Some(Utc::now());
        Ok(cycle.clone())
    }

    async fn get_step(&self, key: &StepKey) -> Result<Option<StepRecord>, AppError> {
        Ok(self.inner.steps.read().await.get(key).cloned())
    }

    async fn record_step(&self, record: &StepRecord) -> Result<(), AppError> {
        self.inner
            .steps
            .write()
            .await
            .entry(record.key())
            .or_insert_with(|| record.clone());
        Ok(())
    }
}

#[async_trait]
impl BillingRunStore for InMemoryStore {
    async fn create_billing_run(
        &self,
        run_type: BillingRunType,
        batch_size: i32,
    ) -> Result<BillingRun, AppError> {
        let run = BillingRun {
            run_id: Uuid::new_v4(),
            run_type: run_type.as_str().to_string(),
            status: BillingRunStatus::Running.as_str().to_string(),
            batch_size,
            started_utc: Utc::now(),
            completed_utc: None,
            subscriptions_scanned: 0,
            subscriptions_enqueued: 0,
            subscriptions_deduplicated: 0,
            subscriptions_failed: 0,
            error_message: None,
        };
        self.inner.runs.write().await.insert(run.run_id, run.clone());
        Ok(run)
    }

    async fn update_billing_run(
        &self,
        run_id: Uuid,
        status: BillingRunStatus,
        counts: &BillingRunCounts,
        error_message: Option<String>,
    ) -> Result<Option<BillingRun>, AppError> {
        let mut runs = self.inner.runs.write().await;
        let Some(run) = runs.get_mut(&run_id) else {
            return Ok(None);
        };

        run.status = status.as_str().to_string();
        if status != BillingRunStatus::Running {
            run.completed_utc = Some(Utc::now());
        }
        run.subscriptions_scanned = counts.scanned;
        run.subscriptions_enqueued = counts.enqueued;
        run.subscriptions_deduplicated = counts.deduplicated;
        run.subscriptions_failed = counts.failed;
        run.error_message = error_message;
        Ok(Some(run.clone()))
    }

    async fn create_billing_run_result(
        &self,
        run_id: Uuid,
        tenant_id: Uuid,
        subscription_id: Uuid,
        status: &str,
        error_message: Option<String>,
    ) -> Result<BillingRunResult, AppError> {
        let result = BillingRunResult {
            result_id: Uuid::new_v4(),
            run_id,
            tenant_id,
            subscription_id,
            status: status.to_string(),
            error_message,
            created_utc: Utc::now(),
        };
        self.inner.run_results.write().await.push(result.clone());
        Ok(result)
    }

    async fn get_billing_run(&self, run_id: Uuid) -> Result<Option<BillingRun>, AppError> {
        Ok(self.inner.runs.read().await.get(&run_id).cloned())
    }

    async fn get_billing_run_results(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<BillingRunResult>, AppError> {
        Ok(self
            .inner
            .run_results
            .read()
            .await
            .iter()
            .filter(|result| result.run_id == run_id)
            .cloned()
            .collect())
    }
}
