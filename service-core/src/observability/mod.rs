pub mod logging;
pub mod trace_context;

pub use logging::init_tracing;
pub use trace_context::{
    IDEMPOTENCY_KEY_HEADER, REQUEST_ID_HEADER, TRACEPARENT_HEADER, TRACESTATE_HEADER,
    outgoing_headers,
};
