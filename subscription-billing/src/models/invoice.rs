//! Invoice model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Finalized,
    Void,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Finalized => "finalized",
            InvoiceStatus::Void => "void",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "finalized" => InvoiceStatus::Finalized,
            "void" => InvoiceStatus::Void,
            _ => InvoiceStatus::Draft,
        }
    }
}

/// Payment status, owned by the payment subsystem after finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "succeeded" => PaymentStatus::Succeeded,
            "failed" => PaymentStatus::Failed,
            "refunded" => PaymentStatus::Refunded,
            _ => PaymentStatus::Pending,
        }
    }
}

/// Persisted invoice for one subscription period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub tenant_id: Uuid,
    pub environment_id: Uuid,
    pub subscription_id: Uuid,
    pub customer_id: Uuid,
    pub invoice_number: Option<String>,
    pub status: String,
    pub payment_status: String,
    pub currency: String,
    pub subtotal: Decimal,
    pub amount_due: Decimal,
    pub amount_paid: Decimal,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub vendor_synced_utc: Option<DateTime<Utc>>,
    pub finalized_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Invoice {
    pub fn status(&self) -> InvoiceStatus {
        InvoiceStatus::from_string(&self.status)
    }

    pub fn payment_status(&self) -> PaymentStatus {
        PaymentStatus::from_string(&self.payment_status)
    }

    pub fn is_finalized(&self) -> bool {
        self.status() == InvoiceStatus::Finalized
    }

    pub fn amount_remaining(&self) -> Decimal {
        (self.amount_due - self.amount_paid).max(Decimal::ZERO)
    }
}

/// Invoice line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct InvoiceLineItem {
    pub line_item_id: Uuid,
    pub invoice_id: Uuid,
    pub price_id: Option<Uuid>,
    pub description: String,
    pub quantity: Decimal,
    pub unit_amount: Decimal,
    pub amount: Decimal,
}

/// Priced line of a draft invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftLineItem {
    pub price_id: Option<Uuid>,
    pub description: String,
    pub quantity: Decimal,
    pub unit_amount: Decimal,
    pub amount: Decimal,
}

/// Priced, not yet persisted invoice for one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftInvoice {
    pub tenant_id: Uuid,
    pub environment_id: Uuid,
    pub subscription_id: Uuid,
    pub customer_id: Uuid,
    pub currency: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub line_items: Vec<DraftLineItem>,
}

impl DraftInvoice {
    pub fn subtotal(&self) -> Decimal {
        self.line_items.iter().map(|item| item.amount).sum()
    }
}

/// Message published for every finalized invoice, consumed by the downstream
/// vendor-sync and payment pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceEvent {
    pub invoice_id: Uuid,
    pub subscription_id: Uuid,
    pub tenant_id: Uuid,
    pub environment_id: Uuid,
}

impl InvoiceEvent {
    pub fn for_invoice(invoice: &Invoice) -> Self {
        Self {
            invoice_id: invoice.invoice_id,
            subscription_id: invoice.subscription_id,
            tenant_id: invoice.tenant_id,
            environment_id: invoice.environment_id,
        }
    }
}
