//! Persistence contracts consumed by the billing engine.
//!
//! `Database` (PostgreSQL) and `InMemoryStore` both implement every trait
//! here. Reads return `Ok(None)` for missing rows; writes carrying a stale
//! `version` fail with `AppError::Conflict`.

use crate::models::{
    BillingPeriod, BillingRun, BillingRunCounts, BillingRunResult, BillingRunStatus,
    BillingRunType, CycleState, CycleStatus, DraftInvoice, Invoice, InvoiceLineItem,
    PaymentStatus, StepKey, StepRecord, Subscription, SubscriptionLineItem, SubscriptionPause,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn get_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError>;

    /// Persist `subscription` if its version is still current; returns the
    /// stored row with the bumped version.
    async fn update_subscription(&self, subscription: &Subscription)
        -> Result<Subscription, AppError>;

    async fn get_pause(
        &self,
        tenant_id: Uuid,
        pause_id: Uuid,
    ) -> Result<Option<SubscriptionPause>, AppError>;

    async fn update_pause(&self, pause: &SubscriptionPause) -> Result<SubscriptionPause, AppError>;

    /// Published subscriptions the scheduler should look at, across tenants,
    /// ordered by `subscription_id` and starting after the `after` cursor.
    async fn list_active_subscriptions(
        &self,
        before: DateTime<Utc>,
        batch_size: i64,
        after: Option<Uuid>,
    ) -> Result<Vec<Subscription>, AppError>;

    async fn list_line_items(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionLineItem>, AppError>;
}

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    /// Create a draft invoice. At most one invoice exists per subscription
    /// period: creating one for a period that already has an invoice returns
    /// the existing row.
    async fn create_invoice(&self, draft: &DraftInvoice) -> Result<Invoice, AppError>;

    /// Finalize and number a draft. Finalizing a finalized invoice is a no-op.
    async fn finalize_invoice(&self, tenant_id: Uuid, invoice_id: Uuid)
        -> Result<Invoice, AppError>;

    async fn get_invoice(&self, tenant_id: Uuid, invoice_id: Uuid)
        -> Result<Option<Invoice>, AppError>;

    async fn find_invoice_for_period(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        period: BillingPeriod,
    ) -> Result<Option<Invoice>, AppError>;

    async fn get_invoice_line_items(&self, invoice_id: Uuid)
        -> Result<Vec<InvoiceLineItem>, AppError>;

    async fn mark_vendor_synced(&self, tenant_id: Uuid, invoice_id: Uuid)
        -> Result<Invoice, AppError>;

    async fn record_payment(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        status: PaymentStatus,
        amount_paid: Decimal,
    ) -> Result<Invoice, AppError>;
}

#[async_trait]
pub trait CycleStore: Send + Sync {
    async fn latest_cycle(&self, subscription_id: Uuid) -> Result<Option<CycleState>, AppError>;

    async fn create_cycle(&self, cycle: &CycleState) -> Result<CycleState, AppError>;

    async fn complete_cycle(
        &self,
        cycle_id: Uuid,
        status: CycleStatus,
        invoices_created: i32,
        last_error: Option<String>,
    ) -> Result<CycleState, AppError>;

    async fn get_step(&self, key: &StepKey) -> Result<Option<StepRecord>, AppError>;

    /// Record a completed step. Recording the same key twice keeps the first record.
    async fn record_step(&self, record: &StepRecord) -> Result<(), AppError>;
}

#[async_trait]
pub trait BillingRunStore: Send + Sync {
    async fn create_billing_run(
        &self,
        run_type: BillingRunType,
        batch_size: i32,
    ) -> Result<BillingRun, AppError>;

    async fn update_billing_run(
        &self,
        run_id: Uuid,
        status: BillingRunStatus,
        counts: &BillingRunCounts,
        error_message: Option<String>,
    ) -> Result<Option<BillingRun>, AppError>;

    async fn create_billing_run_result(
        &self,
        run_id: Uuid,
        tenant_id: Uuid,
        subscription_id: Uuid,
        status: &str,
        error_message: Option<String>,
    ) -> Result<BillingRunResult, AppError>;

    async fn get_billing_run(&self, run_id: Uuid) -> Result<Option<BillingRun>, AppError>;

    async fn get_billing_run_results(&self, run_id: Uuid)
        -> Result<Vec<BillingRunResult>, AppError>;
}

/// Every store the service needs, behind one handle.
pub trait BillingStore: SubscriptionStore + InvoiceStore + CycleStore + BillingRunStore {}

impl<T> BillingStore for T where T: SubscriptionStore + InvoiceStore + CycleStore + BillingRunStore {}

/// The persistence contracts as separate handles onto one backing store.
#[derive(Clone)]
pub struct Stores {
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub invoices: Arc<dyn InvoiceStore>,
    pub cycles: Arc<dyn CycleStore>,
    pub runs: Arc<dyn BillingRunStore>,
}

impl Stores {
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: BillingStore + 'static,
    {
        Self {
            subscriptions: store.clone(),
            invoices: store.clone(),
            cycles: store.clone(),
            runs: store,
        }
    }
}

pub(crate) fn stale_version(entity: &str, id: Uuid, version: i64) -> AppError {
    AppError::Conflict(anyhow::anyhow!(
        "{} {} was modified concurrently (expected version {})",
        entity,
        id,
        version
    ))
}

pub(crate) fn not_found(entity: &str, id: Uuid) -> AppError {
    AppError::NotFound(anyhow::anyhow!("{} {} not found", entity, id))
}

/// Human-facing invoice number for the tenant's `sequence`-th finalized invoice.
pub(crate) fn format_invoice_number(sequence: i64) -> String {
    format!("INV-{:06}", sequence)
}
