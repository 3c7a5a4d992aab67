//! External vendor clients used by the downstream invoice pipeline: invoice
//! export (vendor sync) and payment attempts.

use crate::models::{Invoice, InvoiceLineItem};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use service_core::observability::outgoing_headers;
use std::time::Duration;
use uuid::Uuid;

/// Result of a payment attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub succeeded: bool,
    pub amount: Decimal,
    #[serde(default)]
    pub gateway_reference: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Charge `amount` against `payment_method_id` for the invoice.
    /// `idempotency_key` is stable per invoice so retried attempts are not charged twice.
    async fn attempt_payment(
        &self,
        invoice: &Invoice,
        payment_method_id: &str,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<PaymentAttempt, AppError>;
}

#[async_trait]
pub trait VendorSync: Send + Sync {
    async fn sync_invoice(
        &self,
        invoice: &Invoice,
        line_items: &[InvoiceLineItem],
    ) -> Result<(), AppError>;
}

/// Map a non-success vendor response onto the error taxonomy: 5xx, 408 and
/// 429 are transient, other 4xx are permanent.
fn vendor_error(vendor: &str, status: StatusCode, body: &str) -> AppError {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        AppError::BadGateway(format!("{} returned {}: {}", vendor, status, body))
    } else {
        AppError::BadRequest(anyhow::anyhow!("{} rejected request with {}: {}", vendor, status, body))
    }
}

fn connection_error(vendor: &str, e: reqwest::Error) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(format!("{} request timed out: {}", vendor, e))
    } else {
        AppError::ServiceUnavailable(format!("Failed to reach {}: {}", vendor, e))
    }
}

fn build_client(timeout: Duration) -> Result<Client, AppError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Failed to build HTTP client: {}", e)))
}

// =========================================================================
// HTTP payment gateway
// =========================================================================

#[derive(Debug, Serialize)]
struct ChargeRequest<'a> {
    invoice_id: Uuid,
    customer_id: Uuid,
    payment_method_id: &'a str,
    amount: Decimal,
    currency: &'a str,
}

pub struct HttpPaymentGateway {
    base_url: String,
    client: Client,
}

impl HttpPaymentGateway {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: build_client(timeout)?,
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[tracing::instrument(skip(self, invoice, payment_method_id), fields(invoice_id = %invoice.invoice_id))]
    async fn attempt_payment(
        &self,
        invoice: &Invoice,
        payment_method_id: &str,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<PaymentAttempt, AppError> {
        let request = ChargeRequest {
            invoice_id: invoice.invoice_id,
            customer_id: invoice.customer_id,
            payment_method_id,
            amount,
            currency: &invoice.currency,
        };

        let response = self
            .client
            .post(format!("{}/v1/charges", self.base_url))
            .headers(outgoing_headers(
                &invoice.invoice_id.to_string(),
                idempotency_key,
            ))
            .json(&request)
            .send()
            .await
            .map_err(|e| connection_error("payment gateway", e))?;

        let status = response.status();
        if status == StatusCode::PAYMENT_REQUIRED {
            let body = response.text().await.unwrap_or_default();
            return Ok(PaymentAttempt {
                succeeded: false,
                amount,
                gateway_reference: None,
                failure_reason: Some(body),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(vendor_error("payment gateway", status, &body));
        }

        let attempt: PaymentAttempt = response.json().await.map_err(|e| {
            AppError::BadGateway(format!("Failed to parse payment gateway response: {}", e))
        })?;

        tracing::info!(
            succeeded = attempt.succeeded,
            gateway_reference = ?attempt.gateway_reference,
            "Payment attempt completed"
        );

        Ok(attempt)
    }
}

// =========================================================================
// HTTP vendor sync
// =========================================================================

#[derive(Debug, Serialize)]
struct SyncRequest<'a> {
    invoice: &'a Invoice,
    line_items: &'a [InvoiceLineItem],
}

pub struct HttpVendorSync {
    base_url: String,
    client: Client,
}

impl HttpVendorSync {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: build_client(timeout)?,
        })
    }
}

#[async_trait]
impl VendorSync for HttpVendorSync {
    #[tracing::instrument(skip(self, invoice, line_items), fields(invoice_id = %invoice.invoice_id))]
    async fn sync_invoice(
        &self,
        invoice: &Invoice,
        line_items: &[InvoiceLineItem],
    ) -> Result<(), AppError> {
        let idempotency_key = format!("invoice-sync-{}", invoice.invoice_id);
        let response = self
            .client
            .put(format!("{}/v1/invoices/{}", self.base_url, invoice.invoice_id))
            .headers(outgoing_headers(
                &invoice.invoice_id.to_string(),
                &idempotency_key,
            ))
            .json(&SyncRequest {
                invoice,
                line_items,
            })
            .send()
            .await
            .map_err(|e| connection_error("vendor sync", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(vendor_error("vendor sync", status, &body));
        }

        tracing::info!("Invoice synced to vendor");
        Ok(())
    }
}

// =========================================================================
// Unconfigured vendors
// =========================================================================

/// Used when no vendor sync endpoint is configured.
pub struct DisabledVendorSync;

#[async_trait]
impl VendorSync for DisabledVendorSync {
    async fn sync_invoice(
        &self,
        invoice: &Invoice,
        _line_items: &[InvoiceLineItem],
    ) -> Result<(), AppError> {
        tracing::debug!(invoice_id = %invoice.invoice_id, "Vendor sync not configured, skipping");
        Ok(())
    }
}

/// Used when no payment gateway is configured; every attempt reports "not charged".
pub struct DisabledPaymentGateway;

#[async_trait]
impl PaymentGateway for DisabledPaymentGateway {
    async fn attempt_payment(
        &self,
        invoice: &Invoice,
        _payment_method_id: &str,
        amount: Decimal,
        _idempotency_key: &str,
    ) -> Result<PaymentAttempt, AppError> {
        tracing::debug!(invoice_id = %invoice.invoice_id, "Payment gateway not configured, skipping");
        Ok(PaymentAttempt {
            succeeded: false,
            amount,
            gateway_reference: None,
            failure_reason: Some("payment gateway not configured".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::REQUEST_TIMEOUT,
        ] {
            assert!(vendor_error("gateway", status, "").is_retryable());
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        for status in [StatusCode::BAD_REQUEST, StatusCode::NOT_FOUND, StatusCode::CONFLICT] {
            let err = vendor_error("gateway", status, "bad");
            assert!(!err.is_retryable());
            assert_eq!(err.kind(), "validation");
        }
    }
}
