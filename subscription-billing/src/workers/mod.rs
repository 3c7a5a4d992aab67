pub mod executor;
pub mod invoice_processor;

pub use executor::{CycleEnqueuer, CycleExecutor, CycleRequest, EnqueueResult, ExecutorConfig};
pub use invoice_processor::{InvoiceProcessor, PaymentOutcome, ProcessReport};
