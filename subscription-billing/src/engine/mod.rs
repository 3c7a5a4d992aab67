//! Billing period advancement engine.

pub mod cancellation;
pub mod materializer;
pub mod orchestrator;
pub mod pause;
pub mod period;
pub mod scheduler;

pub use cancellation::{apply_cancellation, evaluate_cancellation};
pub use materializer::{InvoiceMaterializer, Materialized};
pub use orchestrator::{BillingOrchestrator, CycleOutcome, SkipReason, TriggerResult};
pub use pause::{evaluate_pause, PauseDecision};
pub use period::{calculate_periods, next_billing_date, PeriodCalculation, PeriodSchedule};
pub use scheduler::{effective_batch_size, FleetScheduler, DEFAULT_BATCH_SIZE};
