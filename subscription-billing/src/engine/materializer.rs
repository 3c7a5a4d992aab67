//! Invoice materializer: turns one elapsed billing period into a finalized invoice.

use crate::models::{BillingPeriod, Invoice, InvoiceStatus, Subscription};
use crate::services::metrics;
use crate::services::pricing::InvoiceCalculator;
use crate::services::repository::InvoiceStore;
use rust_decimal::Decimal;
use service_core::error::AppError;
use service_core::retry::{retry_with_policy, RetryPolicy};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Result of materializing one period.
#[derive(Debug, Clone, PartialEq)]
pub enum Materialized {
    /// The period is billed by this finalized invoice. `created` is false when
    /// the invoice already existed from an earlier attempt.
    Finalized { invoice: Invoice, created: bool },
    /// Nothing to bill; no draft was persisted.
    ZeroValue,
}

impl Materialized {
    pub fn invoice_id(&self) -> Option<Uuid> {
        match self {
            Materialized::Finalized { invoice, .. } => Some(invoice.invoice_id),
            Materialized::ZeroValue => None,
        }
    }

    pub fn created(&self) -> bool {
        matches!(self, Materialized::Finalized { created: true, .. })
    }
}

pub struct InvoiceMaterializer {
    invoices: Arc<dyn InvoiceStore>,
    calculator: Arc<dyn InvoiceCalculator>,
    policy: RetryPolicy,
}

impl InvoiceMaterializer {
    pub fn new(
        invoices: Arc<dyn InvoiceStore>,
        calculator: Arc<dyn InvoiceCalculator>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            invoices,
            calculator,
            policy,
        }
    }

    /// Create and finalize the invoice for `period`.
    ///
    /// An invoice left over from an earlier attempt (drafted but never
    /// finalized, or finalized but never recorded) is picked up and finalized
    /// in place, so a period never gets a second invoice.
    #[instrument(
        skip(self, subscription),
        fields(subscription_id = %subscription.subscription_id, period = %period)
    )]
    pub async fn materialize(
        &self,
        subscription: &Subscription,
        period: BillingPeriod,
    ) -> Result<Materialized, AppError> {
        let tenant_id = subscription.tenant_id;
        let tenant = tenant_id.to_string();

        let existing = retry_with_policy(&self.policy, "find_invoice_for_period", || {
            self.invoices
                .find_invoice_for_period(tenant_id, subscription.subscription_id, period)
        })
        .await?;

        if let Some(invoice) = existing {
            if invoice.status() == InvoiceStatus::Void {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "invoice {} for period {} is void",
                    invoice.invoice_id,
                    period
                )));
            }
            let invoice = self.finalize(&invoice).await?;
            info!(invoice_id = %invoice.invoice_id, "Recovered invoice from earlier attempt");
            metrics::record_invoice_materialized(&tenant, "recovered");
            return Ok(Materialized::Finalized {
                invoice,
                created: false,
            });
        }

        let draft = retry_with_policy(&self.policy, "prepare_invoice", || {
            self.calculator.prepare_invoice(subscription, period)
        })
        .await?;

        if draft.subtotal() == Decimal::ZERO {
            debug!("Zero subtotal, skipping invoice");
            metrics::record_invoice_materialized(&tenant, "zero_value");
            return Ok(Materialized::ZeroValue);
        }

        let draft_invoice = retry_with_policy(&self.policy, "create_invoice", || {
            self.invoices.create_invoice(&draft)
        })
        .await?;

        let invoice = self.finalize(&draft_invoice).await?;

        info!(
            invoice_id = %invoice.invoice_id,
            invoice_number = ?invoice.invoice_number,
            subtotal = %invoice.subtotal,
            "Invoice materialized"
        );
        metrics::record_invoice_materialized(&tenant, "created");

        Ok(Materialized::Finalized {
            invoice,
            created: true,
        })
    }

    async fn finalize(&self, invoice: &Invoice) -> Result<Invoice, AppError> {
        if invoice.is_finalized() {
            return Ok(invoice.clone());
        }
        retry_with_policy(&self.policy, "finalize_invoice", || {
            self.invoices
                .finalize_invoice(invoice.tenant_id, invoice.invoice_id)
        })
        .await
    }
}
