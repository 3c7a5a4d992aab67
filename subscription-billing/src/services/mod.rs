pub mod database;
pub mod gateway;
pub mod memory;
pub mod metrics;
pub mod pricing;
pub mod queue;
pub mod repository;

pub use database::Database;
pub use gateway::{
    DisabledPaymentGateway, DisabledVendorSync, HttpPaymentGateway, HttpVendorSync,
    PaymentAttempt, PaymentGateway, VendorSync,
};
pub use memory::InMemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use pricing::{InvoiceCalculator, LineItemPricer};
pub use queue::{InMemoryInvoiceQueue, InvoiceDelivery, InvoiceQueue, RedisInvoiceQueue};
pub use repository::{
    BillingRunStore, BillingStore, CycleStore, InvoiceStore, Stores, SubscriptionStore,
};
