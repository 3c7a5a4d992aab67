//! Domain models for subscription-billing.

mod billing_run;
mod cycle;
mod invoice;
mod pause;
mod subscription;

pub use billing_run::{
    BillingRun, BillingRunCounts, BillingRunResult, BillingRunStatus, BillingRunType,
};
pub use cycle::{BillingPeriod, CycleState, CycleStatus, CycleStep, StepKey, StepRecord};
pub use invoice::{
    DraftInvoice, DraftLineItem, Invoice, InvoiceEvent, InvoiceLineItem, InvoiceStatus,
    PaymentStatus,
};
pub use pause::{PauseMode, SubscriptionPause};
pub use subscription::{
    BillingCadence, PauseStatus, Subscription, SubscriptionLineItem, SubscriptionStatus,
};
