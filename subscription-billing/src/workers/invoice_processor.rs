//! Downstream invoice processing.
//!
//! Consumes the events published by billing cycles and, per invoice, makes
//! sure it is finalized, exports it to the vendor, and attempts payment.
//! Every step is safe to repeat: a redelivered event finds the work done.

use crate::models::{InvoiceEvent, PaymentStatus};
use crate::services::gateway::{PaymentGateway, VendorSync};
use crate::services::metrics;
use crate::services::queue::InvoiceQueue;
use crate::services::repository::{InvoiceStore, SubscriptionStore};
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use service_core::retry::{retry_with_policy, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

const RECEIVE_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PaymentOutcome {
    AlreadyPaid,
    NothingDue,
    Succeeded {
        amount: Decimal,
        gateway_reference: Option<String>,
    },
    Declined {
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    /// False when an earlier delivery already synced the invoice.
    pub vendor_synced: bool,
    pub payment: PaymentOutcome,
}

pub struct InvoiceProcessor {
    invoices: Arc<dyn InvoiceStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    vendor: Arc<dyn VendorSync>,
    gateway: Arc<dyn PaymentGateway>,
    policy: RetryPolicy,
}

impl InvoiceProcessor {
    pub fn new(
        invoices: Arc<dyn InvoiceStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        vendor: Arc<dyn VendorSync>,
        gateway: Arc<dyn PaymentGateway>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            invoices,
            subscriptions,
            vendor,
            gateway,
            policy,
        }
    }

    #[instrument(skip(self), fields(invoice_id = %event.invoice_id, subscription_id = %event.subscription_id))]
    pub async fn process_invoice(&self, event: &InvoiceEvent) -> Result<ProcessReport, AppError> {
        let tenant_id = event.tenant_id;
        let invoice_id = event.invoice_id;

        // EnsureFinalized
        let invoice = retry_with_policy(&self.policy, "get_invoice", || {
            self.invoices.get_invoice(tenant_id, invoice_id)
        })
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("invoice {} not found", invoice_id)))?;

        let invoice = if invoice.is_finalized() {
            invoice
        } else {
            retry_with_policy(&self.policy, "finalize_invoice", || {
                self.invoices.finalize_invoice(tenant_id, invoice_id)
            })
            .await
            .inspect_err(|e| metrics::record_invoice_processing("finalize", e.kind()))?
        };

        // SyncToVendor
        let vendor_synced = if invoice.vendor_synced_utc.is_some() {
            false
        } else {
            let line_items = retry_with_policy(&self.policy, "get_invoice_line_items", || {
                self.invoices.get_invoice_line_items(invoice_id)
            })
            .await?;

            retry_with_policy(&self.policy, "vendor_sync", || {
                self.vendor.sync_invoice(&invoice, &line_items)
            })
            .await
            .inspect_err(|e| metrics::record_invoice_processing("vendor_sync", e.kind()))?;

            retry_with_policy(&self.policy, "mark_vendor_synced", || {
                self.invoices.mark_vendor_synced(tenant_id, invoice_id)
            })
            .await?;
            metrics::record_invoice_processing("vendor_sync", "success");
            true
        };

        // AttemptPayment
        if invoice.payment_status() == PaymentStatus::Succeeded {
            return Ok(ProcessReport {
                vendor_synced,
                payment: PaymentOutcome::AlreadyPaid,
            });
        }

        let amount = invoice.amount_remaining();
        if amount <= Decimal::ZERO {
            return Ok(ProcessReport {
                vendor_synced,
                payment: PaymentOutcome::NothingDue,
            });
        }

        let subscription = retry_with_policy(&self.policy, "get_subscription", || {
            self.subscriptions
                .get_subscription(tenant_id, event.subscription_id)
        })
        .await?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!(
                "subscription {} not found",
                event.subscription_id
            ))
        })?;

        let Some(payment_method_id) = subscription.payment_method_id.as_deref() else {
            metrics::record_invoice_processing("payment", "validation");
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "subscription {} has no payment method",
                subscription.subscription_id
            )));
        };

        let idempotency_key = format!("invoice-payment-{}", invoice_id);
        let attempt = retry_with_policy(&self.policy, "attempt_payment", || {
            self.gateway
                .attempt_payment(&invoice, payment_method_id, amount, &idempotency_key)
        })
        .await
        .inspect_err(|e| metrics::record_invoice_processing("payment", e.kind()))?;

        let payment = if attempt.succeeded {
            retry_with_policy(&self.policy, "record_payment", || {
                self.invoices
                    .record_payment(tenant_id, invoice_id, PaymentStatus::Succeeded, attempt.amount)
            })
            .await?;
            metrics::record_invoice_processing("payment", "success");
            info!(amount = %attempt.amount, "Payment succeeded");
            PaymentOutcome::Succeeded {
                amount: attempt.amount,
                gateway_reference: attempt.gateway_reference,
            }
        } else {
            retry_with_policy(&self.policy, "record_payment", || {
                self.invoices
                    .record_payment(tenant_id, invoice_id, PaymentStatus::Failed, Decimal::ZERO)
            })
            .await?;
            metrics::record_invoice_processing("payment", "declined");
            warn!(reason = ?attempt.failure_reason, "Payment declined");
            PaymentOutcome::Declined {
                reason: attempt.failure_reason,
            }
        };

        Ok(ProcessReport {
            vendor_synced,
            payment,
        })
    }

    /// Consume `queue` with `worker_count` workers until `shutdown` is cancelled.
    pub fn spawn_workers(
        self: Arc<Self>,
        queue: Arc<dyn InvoiceQueue>,
        worker_count: usize,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..worker_count.max(1))
            .map(|worker_id| {
                let processor = self.clone();
                let queue = queue.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    processor.consume(worker_id, queue, shutdown).await;
                })
            })
            .collect()
    }

    async fn consume(
        &self,
        worker_id: usize,
        queue: Arc<dyn InvoiceQueue>,
        shutdown: CancellationToken,
    ) {
        info!(worker_id = worker_id, "Invoice worker started");
        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = queue.receive(RECEIVE_WAIT) => delivery,
            };

            let delivery = match delivery {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) => {
                    warn!(worker_id = worker_id, error = %e, "Failed to receive invoice event");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let settled = match self.process_invoice(&delivery.event).await {
                Ok(report) => {
                    info!(
                        invoice_id = %delivery.event.invoice_id,
                        vendor_synced = report.vendor_synced,
                        payment = ?report.payment,
                        "Invoice processed"
                    );
                    true
                }
                Err(e) => {
                    error!(
                        invoice_id = %delivery.event.invoice_id,
                        error = %e,
                        retryable = e.is_retryable(),
                        "Invoice processing failed"
                    );
                    metrics::record_error(e.kind(), "process_invoice");
                    !e.is_retryable()
                }
            };

            if settled {
                if let Err(e) = queue.ack(&delivery).await {
                    warn!(invoice_id = %delivery.event.invoice_id, error = %e, "Failed to ack invoice event");
                }
            } else if let Err(e) = queue.requeue(&delivery).await {
                // Left claimed; recovered on the next startup.
                warn!(invoice_id = %delivery.event.invoice_id, error = %e, "Failed to requeue invoice event");
            }
        }
        info!(worker_id = worker_id, "Invoice worker stopped");
    }
}
