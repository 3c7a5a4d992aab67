//! Database service for subscription-billing.

use crate::models::{
    BillingPeriod, BillingRun, BillingRunCounts, BillingRunResult, BillingRunStatus,
    BillingRunType, CycleState, CycleStatus, DraftInvoice, Invoice, InvoiceLineItem,
    InvoiceStatus, PaymentStatus, StepKey, StepRecord, Subscription, SubscriptionLineItem,
    SubscriptionPause,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::repository::{
    format_invoice_number, not_found, stale_version, BillingRunStore, CycleStore, InvoiceStore,
    SubscriptionStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

fn db_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> AppError {
    move |e| AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "subscription-billing"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

// =========================================================================
// Subscription Operations
// =========================================================================

#[async_trait]
impl SubscriptionStore for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_error("Health check failed"))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, subscription_id = %subscription_id))]
    async fn get_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT subscription_id, tenant_id, environment_id, customer_id, plan_id, status, currency, billing_anchor, billing_cadence, billing_period_count, current_period_start, current_period_end, end_date, cancel_at_period_end, cancel_at, cancelled_at, pause_status, active_pause_id, payment_method_id, published, version, created_utc, updated_utc
            FROM subscriptions
            WHERE tenant_id = $1 AND subscription_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get subscription"))?;

        timer.observe_duration();

        Ok(subscription)
    }

    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.subscription_id, version = subscription.version))]
    async fn update_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<Subscription, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_subscription"])
            .start_timer();

        let updated = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET status = $4, current_period_start = $5, current_period_end = $6, cancelled_at = $7, pause_status = $8, active_pause_id = $9, version = version + 1, updated_utc = $10
            WHERE tenant_id = $1 AND subscription_id = $2 AND version = $3
            RETURNING subscription_id, tenant_id, environment_id, customer_id, plan_id, status, currency, billing_anchor, billing_cadence, billing_period_count, current_period_start, current_period_end, end_date, cancel_at_period_end, cancel_at, cancelled_at, pause_status, active_pause_id, payment_method_id, published, version, created_utc, updated_utc
            "#,
        )
        .bind(subscription.tenant_id)
        .bind(subscription.subscription_id)
        .bind(subscription.version)
        .bind(&subscription.status)
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.cancelled_at)
        .bind(&subscription.pause_status)
        .bind(subscription.active_pause_id)
        .bind(subscription.updated_utc)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to update subscription"))?;

        timer.observe_duration();

        match updated {
            Some(updated) => Ok(updated),
            None => {
                let exists = self
                    .get_subscription(subscription.tenant_id, subscription.subscription_id)
                    .await?
                    .is_some();
                if exists {
                    Err(stale_version(
                        "subscription",
                        subscription.subscription_id,
                        subscription.version,
                    ))
                } else {
                    Err(not_found("subscription", subscription.subscription_id))
                }
            }
        }
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, pause_id = %pause_id))]
    async fn get_pause(
        &self,
        tenant_id: Uuid,
        pause_id: Uuid,
    ) -> Result<Option<SubscriptionPause>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_pause"])
            .start_timer();

        let pause = sqlx::query_as::<_, SubscriptionPause>(
            r#"
            SELECT pause_id, tenant_id, subscription_id, pause_mode, pause_status, pause_start, pause_end, resumed_at, version, created_utc, updated_utc
            FROM subscription_pauses
            WHERE tenant_id = $1 AND pause_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(pause_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get pause"))?;

        timer.observe_duration();

        Ok(pause)
    }

    #[instrument(skip(self, pause), fields(pause_id = %pause.pause_id, version = pause.version))]
    async fn update_pause(&self, pause: &SubscriptionPause) -> Result<SubscriptionPause, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_pause"])
            .start_timer();

        let updated = sqlx::query_as::<_, SubscriptionPause>(
            r#"
            UPDATE subscription_pauses
            SET pause_status = $4, resumed_at = $5, version = version + 1, updated_utc = $6
            WHERE tenant_id = $1 AND pause_id = $2 AND version = $3
            RETURNING pause_id, tenant_id, subscription_id, pause_mode, pause_status, pause_start, pause_end, resumed_at, version, created_utc, updated_utc
            "#,
        )
        .bind(pause.tenant_id)
        .bind(pause.pause_id)
        .bind(pause.version)
        .bind(&pause.pause_status)
        .bind(pause.resumed_at)
        .bind(pause.updated_utc)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to update pause"))?;

        timer.observe_duration();

        match updated {
            Some(updated) => Ok(updated),
            None => match self.get_pause(pause.tenant_id, pause.pause_id).await? {
                Some(_) => Err(stale_version("pause", pause.pause_id, pause.version)),
                None => Err(not_found("pause", pause.pause_id)),
            },
        }
    }

    #[instrument(skip(self))]
    async fn list_active_subscriptions(
        &self,
        before: DateTime<Utc>,
        batch_size: i64,
        after: Option<Uuid>,
    ) -> Result<Vec<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_active_subscriptions"])
            .start_timer();

        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT s.subscription_id, s.tenant_id, s.environment_id, s.customer_id, s.plan_id, s.status, s.currency, s.billing_anchor, s.billing_cadence, s.billing_period_count, s.current_period_start, s.current_period_end, s.end_date, s.cancel_at_period_end, s.cancel_at, s.cancelled_at, s.pause_status, s.active_pause_id, s.payment_method_id, s.published, s.version, s.created_utc, s.updated_utc
            FROM subscriptions s
            LEFT JOIN subscription_pauses p ON p.pause_id = s.active_pause_id
            WHERE s.published
              AND (
                    (s.status IN ('active', 'trialing') AND (
                        s.current_period_end <= $1
                     OR (s.pause_status = 'scheduled' AND (
                            p.pause_id IS NULL
                         OR p.pause_status <> 'scheduled'
                         OR (p.pause_mode <> 'period_end' AND p.pause_start <= $1)))))
                 OR (s.status = 'paused' AND s.pause_status = 'active' AND (
                        p.pause_id IS NULL
                     OR p.pause_status = 'completed'
                     OR p.pause_end <= $1))
              )
              AND ($2::uuid IS NULL OR s.subscription_id > $2)
            ORDER BY s.subscription_id
            LIMIT $3
            "#,
        )
        .bind(before)
        .bind(after)
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list active subscriptions"))?;

        timer.observe_duration();

        Ok(subscriptions)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, subscription_id = %subscription_id))]
    async fn list_line_items(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionLineItem>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_line_items"])
            .start_timer();

        let items = sqlx::query_as::<_, SubscriptionLineItem>(
            r#"
            SELECT li.line_item_id, li.subscription_id, li.price_id, li.description, li.quantity, li.unit_amount, li.start_date, li.end_date
            FROM subscription_line_items li
            JOIN subscriptions s ON s.subscription_id = li.subscription_id
            WHERE s.tenant_id = $1 AND li.subscription_id = $2
            ORDER BY li.line_item_id
            "#,
        )
        .bind(tenant_id)
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list subscription line items"))?;

        timer.observe_duration();

        Ok(items)
    }
}

// =========================================================================
// Invoice Operations
// =========================================================================

#[async_trait]
impl InvoiceStore for Database {
    #[instrument(skip(self, draft), fields(subscription_id = %draft.subscription_id, period_start = %draft.period_start))]
    async fn create_invoice(&self, draft: &DraftInvoice) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_invoice"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))?;

        let subtotal = draft.subtotal();
        let inserted = sqlx::query_as::<_, Invoice>(
            r#"
            INSERT INTO invoices (invoice_id, tenant_id, environment_id, subscription_id, customer_id, currency, subtotal, amount_due, period_start, period_end)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7, $8, $9)
            ON CONFLICT (subscription_id, period_start, period_end) DO NOTHING
            RETURNING invoice_id, tenant_id, environment_id, subscription_id, customer_id, invoice_number, status, payment_status, currency, subtotal, amount_due, amount_paid, period_start, period_end, vendor_synced_utc, finalized_utc, created_utc, updated_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(draft.tenant_id)
        .bind(draft.environment_id)
        .bind(draft.subscription_id)
        .bind(draft.customer_id)
        .bind(&draft.currency)
        .bind(subtotal)
        .bind(draft.period_start)
        .bind(draft.period_end)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to create invoice"))?;

        let invoice = match inserted {
            Some(invoice) => {
                for item in &draft.line_items {
                    sqlx::query(
                        r#"
                        INSERT INTO invoice_line_items (line_item_id, invoice_id, price_id, description, quantity, unit_amount, amount)
                        VALUES ($1, $2, $3, $4, $5, $6, $7)
                        "#,
                    )
                    .bind(Uuid::new_v4())
                    .bind(invoice.invoice_id)
                    .bind(item.price_id)
                    .bind(&item.description)
                    .bind(item.quantity)
                    .bind(item.unit_amount)
                    .bind(item.amount)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_error("Failed to create invoice line item"))?;
                }
                info!(invoice_id = %invoice.invoice_id, subtotal = %subtotal, "Invoice created");
                invoice
            }
            None => {
                let existing = sqlx::query_as::<_, Invoice>(
                    r#"
                    SELECT invoice_id, tenant_id, environment_id, subscription_id, customer_id, invoice_number, status, payment_status, currency, subtotal, amount_due, amount_paid, period_start, period_end, vendor_synced_utc, finalized_utc, created_utc, updated_utc
                    FROM invoices
                    WHERE subscription_id = $1 AND period_start = $2 AND period_end = $3
                    "#,
                )
                .bind(draft.subscription_id)
                .bind(draft.period_start)
                .bind(draft.period_end)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_error("Failed to read existing invoice"))?;
                info!(invoice_id = %existing.invoice_id, "Invoice already exists for period");
                existing
            }
        };

        tx.commit()
            .await
            .map_err(db_error("Failed to commit invoice"))?;

        timer.observe_duration();

        Ok(invoice)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    async fn finalize_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["finalize_invoice"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))?;

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, tenant_id, environment_id, subscription_id, customer_id, invoice_number, status, payment_status, currency, subtotal, amount_due, amount_paid, period_start, period_end, vendor_synced_utc, finalized_utc, created_utc, updated_utc
            FROM invoices
            WHERE tenant_id = $1 AND invoice_id = $2
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to lock invoice"))?
        .ok_or_else(|| not_found("invoice", invoice_id))?;

        match invoice.status() {
            InvoiceStatus::Finalized => return Ok(invoice),
            InvoiceStatus::Void => {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "invoice {} is void and cannot be finalized",
                    invoice_id
                )))
            }
            InvoiceStatus::Draft => {}
        }

        let sequence: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO invoice_sequences (tenant_id, last_value)
            VALUES ($1, 1)
            ON CONFLICT (tenant_id) DO UPDATE SET last_value = invoice_sequences.last_value + 1
            RETURNING last_value
            "#,
        )
        .bind(tenant_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to allocate invoice number"))?;

        let finalized = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET status = 'finalized', invoice_number = $3, finalized_utc = NOW(), updated_utc = NOW()
            WHERE tenant_id = $1 AND invoice_id = $2
            RETURNING invoice_id, tenant_id, environment_id, subscription_id, customer_id, invoice_number, status, payment_status, currency, subtotal, amount_due, amount_paid, period_start, period_end, vendor_synced_utc, finalized_utc, created_utc, updated_utc
            "#,
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .bind(format_invoice_number(sequence))
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to finalize invoice"))?;

        tx.commit()
            .await
            .map_err(db_error("Failed to commit invoice finalization"))?;

        timer.observe_duration();
        info!(invoice_number = ?finalized.invoice_number, "Invoice finalized");

        Ok(finalized)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    async fn get_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, tenant_id, environment_id, subscription_id, customer_id, invoice_number, status, payment_status, currency, subtotal, amount_due, amount_paid, period_start, period_end, vendor_synced_utc, finalized_utc, created_utc, updated_utc
            FROM invoices
            WHERE tenant_id = $1 AND invoice_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get invoice"))?;

        timer.observe_duration();

        Ok(invoice)
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id, period = %period))]
    async fn find_invoice_for_period(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        period: BillingPeriod,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_invoice_for_period"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, tenant_id, environment_id, subscription_id, customer_id, invoice_number, status, payment_status, currency, subtotal, amount_due, amount_paid, period_start, period_end, vendor_synced_utc, finalized_utc, created_utc, updated_utc
            FROM invoices
            WHERE tenant_id = $1 AND subscription_id = $2 AND period_start = $3 AND period_end = $4
            "#,
        )
        .bind(tenant_id)
        .bind(subscription_id)
        .bind(period.start)
        .bind(period.end)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to find invoice for period"))?;

        timer.observe_duration();

        Ok(invoice)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn get_invoice_line_items(
        &self,
        invoice_id: Uuid,
    ) -> Result<Vec<InvoiceLineItem>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice_line_items"])
            .start_timer();

        let items = sqlx::query_as::<_, InvoiceLineItem>(
            r#"
            SELECT line_item_id, invoice_id, price_id, description, quantity, unit_amount, amount
            FROM invoice_line_items
            WHERE invoice_id = $1
            ORDER BY line_item_id
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to get invoice line items"))?;

        timer.observe_duration();

        Ok(items)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn mark_vendor_synced(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_vendor_synced"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET vendor_synced_utc = COALESCE(vendor_synced_utc, NOW()), updated_utc = NOW()
            WHERE tenant_id = $1 AND invoice_id = $2
            RETURNING invoice_id, tenant_id, environment_id, subscription_id, customer_id, invoice_number, status, payment_status, currency, subtotal, amount_due, amount_paid, period_start, period_end, vendor_synced_utc, finalized_utc, created_utc, updated_utc
            "#,
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to mark invoice synced"))?
        .ok_or_else(|| not_found("invoice", invoice_id))?;

        timer.observe_duration();

        Ok(invoice)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id, status = status.as_str()))]
    async fn record_payment(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        status: PaymentStatus,
        amount_paid: Decimal,
    ) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_payment"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET payment_status = $3, amount_paid = amount_paid + $4, updated_utc = NOW()
            WHERE tenant_id = $1 AND invoice_id = $2
            RETURNING invoice_id, tenant_id, environment_id, subscription_id, customer_id, invoice_number, status, payment_status, currency, subtotal, amount_due, amount_paid, period_start, period_end, vendor_synced_utc, finalized_utc, created_utc, updated_utc
            "#,
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .bind(status.as_str())
        .bind(amount_paid)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to record payment"))?
        .ok_or_else(|| not_found("invoice", invoice_id))?;

        timer.observe_duration();

        Ok(invoice)
    }
}

// =========================================================================
// Cycle State and Step Log
// =========================================================================

#[async_trait]
impl CycleStore for Database {
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn latest_cycle(&self, subscription_id: Uuid) -> Result<Option<CycleState>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["latest_cycle"])
            .start_timer();

        let cycle = sqlx::query_as::<_, CycleState>(
            r#"
            SELECT cycle_id, tenant_id, subscription_id, status, period_start, period_end, attempt, invoices_created, last_error, started_utc, completed_utc
            FROM billing_cycles
            WHERE subscription_id = $1
            ORDER BY started_utc DESC
            LIMIT 1
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get latest billing cycle"))?;

        timer.observe_duration();

        Ok(cycle)
    }

    #[instrument(skip(self, cycle), fields(cycle_id = %cycle.cycle_id, subscription_id = %cycle.subscription_id))]
    async fn create_cycle(&self, cycle: &CycleState) -> Result<CycleState, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_cycle"])
            .start_timer();

        let created = sqlx::query_as::<_, CycleState>(
            r#"
            INSERT INTO billing_cycles (cycle_id, tenant_id, subscription_id, status, period_start, period_end, attempt, started_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING cycle_id, tenant_id, subscription_id, status, period_start, period_end, attempt, invoices_created, last_error, started_utc, completed_utc
            "#,
        )
        .bind(cycle.cycle_id)
        .bind(cycle.tenant_id)
        .bind(cycle.subscription_id)
        .bind(&cycle.status)
        .bind(cycle.period_start)
        .bind(cycle.period_end)
        .bind(cycle.attempt)
        .bind(cycle.started_utc)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to create billing cycle"))?;

        timer.observe_duration();

        Ok(created)
    }

    #[instrument(skip(self, last_error), fields(cycle_id = %cycle_id, status = status.as_str()))]
    async fn complete_cycle(
        &self,
        cycle_id: Uuid,
        status: CycleStatus,
        invoices_created: i32,
        last_error: Option<String>,
    ) -> Result<CycleState, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["complete_cycle"])
            .start_timer();

        let cycle = sqlx::query_as::<_, CycleState>(
            r#"
            UPDATE billing_cycles
            SET status = $2, invoices_created = $3, last_error = $4, completed_utc = NOW()
            WHERE cycle_id = $1
            RETURNING cycle_id, tenant_id, subscription_id, status, period_start, period_end, attempt, invoices_created, last_error, started_utc, completed_utc
            "#,
        )
        .bind(cycle_id)
        .bind(status.as_str())
        .bind(invoices_created)
        .bind(last_error)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to complete billing cycle"))?
        .ok_or_else(|| not_found("billing cycle", cycle_id))?;

        timer.observe_duration();

        Ok(cycle)
    }

    #[instrument(skip(self, key), fields(subscription_id = %key.subscription_id, step = %key.step))]
    async fn get_step(&self, key: &StepKey) -> Result<Option<StepRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_step"])
            .start_timer();

        let record = sqlx::query_as::<_, StepRecord>(
            r#"
            SELECT subscription_id, step, period_start, period_end, cycle_id, invoice_id, completed_utc
            FROM billing_cycle_steps
            WHERE subscription_id = $1 AND step = $2 AND period_start = $3 AND period_end = $4
            "#,
        )
        .bind(key.subscription_id)
        .bind(&key.step)
        .bind(key.period_start)
        .bind(key.period_end)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get step record"))?;

        timer.observe_duration();

        Ok(record)
    }

    #[instrument(skip(self, record), fields(subscription_id = %record.subscription_id, step = %record.step))]
    async fn record_step(&self, record: &StepRecord) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_step"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO billing_cycle_steps (subscription_id, step, period_start, period_end, cycle_id, invoice_id, completed_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (subscription_id, step, period_start, period_end) DO NOTHING
            "#,
        )
        .bind(record.subscription_id)
        .bind(&record.step)
        .bind(record.period_start)
        .bind(record.period_end)
        .bind(record.cycle_id)
        .bind(record.invoice_id)
        .bind(record.completed_utc)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to record step"))?;

        timer.observe_duration();

        Ok(())
    }
}

// =========================================================================
// Billing Run Operations
// =========================================================================

#[async_trait]
impl BillingRunStore for Database {
    #[instrument(skip(self))]
    async fn create_billing_run(
        &self,
        run_type: BillingRunType,
        batch_size: i32,
    ) -> Result<BillingRun, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_billing_run"])
            .start_timer();

        let run = sqlx::query_as::<_, BillingRun>(
            r#"
            INSERT INTO billing_runs (run_id, run_type, batch_size)
            VALUES ($1, $2, $3)
            RETURNING run_id, run_type, status, batch_size, started_utc, completed_utc, subscriptions_scanned, subscriptions_enqueued, subscriptions_deduplicated, subscriptions_failed, error_message
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(run_type.as_str())
        .bind(batch_size)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to create billing run"))?;

        timer.observe_duration();

        Ok(run)
    }

    #[instrument(skip(self, counts), fields(run_id = %run_id))]
    async fn update_billing_run(
        &self,
        run_id: Uuid,
        status: BillingRunStatus,
        counts: &BillingRunCounts,
        error_message: Option<String>,
    ) -> Result<Option<BillingRun>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_billing_run"])
            .start_timer();

        let completed_utc = if status != BillingRunStatus::Running {
            Some(Utc::now())
        } else {
            None
        };

        let run = sqlx::query_as::<_, BillingRun>(
            r#"
            UPDATE billing_runs
            SET status = $2, completed_utc = COALESCE($3, completed_utc), subscriptions_scanned = $4, subscriptions_enqueued = $5, subscriptions_deduplicated = $6, subscriptions_failed = $7, error_message = $8
            WHERE run_id = $1
            RETURNING run_id, run_type, status, batch_size, started_utc, completed_utc, subscriptions_scanned, subscriptions_enqueued, subscriptions_deduplicated, subscriptions_failed, error_message
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(completed_utc)
        .bind(counts.scanned)
        .bind(counts.enqueued)
        .bind(counts.deduplicated)
        .bind(counts.failed)
        .bind(error_message)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to update billing run"))?;

        timer.observe_duration();

        Ok(run)
    }

    #[instrument(skip(self, error_message), fields(run_id = %run_id, subscription_id = %subscription_id))]
    async fn create_billing_run_result(
        &self,
        run_id: Uuid,
        tenant_id: Uuid,
        subscription_id: Uuid,
        status: &str,
        error_message: Option<String>,
    ) -> Result<BillingRunResult, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_billing_run_result"])
            .start_timer();

        let result = sqlx::query_as::<_, BillingRunResult>(
            r#"
            INSERT INTO billing_run_results (result_id, run_id, tenant_id, subscription_id, status, error_message)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING result_id, run_id, tenant_id, subscription_id, status, error_message, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(run_id)
        .bind(tenant_id)
        .bind(subscription_id)
        .bind(status)
        .bind(error_message)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to create billing run result"))?;

        timer.observe_duration();

        Ok(result)
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn get_billing_run(&self, run_id: Uuid) -> Result<Option<BillingRun>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_billing_run"])
            .start_timer();

        let run = sqlx::query_as::<_, BillingRun>(
            r#"
            SELECT run_id, run_type, status, batch_size, started_utc, completed_utc, subscriptions_scanned, subscriptions_enqueued, subscriptions_deduplicated, subscriptions_failed, error_message
            FROM billing_runs
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get billing run"))?;

        timer.observe_duration();

        Ok(run)
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn get_billing_run_results(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<BillingRunResult>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_billing_run_results"])
            .start_timer();

        let results = sqlx::query_as::<_, BillingRunResult>(
            r#"
            SELECT result_id, run_id, tenant_id, subscription_id, status, error_message, created_utc
            FROM billing_run_results
            WHERE run_id = $1
            ORDER BY created_utc
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to get billing run results"))?;

        timer.observe_duration();

        Ok(results)
    }
}
