//! Header propagation for calls to external collaborators.
//!
//! Every outgoing request carries the W3C trace context of the current span,
//! a correlation id, and an idempotency key so that a retried call is
//! recognised by the receiving system.

use opentelemetry::trace::TraceContextExt;
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";
pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Build the header set for one outgoing call.
pub fn outgoing_headers(request_id: &str, idempotency_key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    insert_trace_context(&mut headers);

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(idempotency_key) {
        headers.insert(IDEMPOTENCY_KEY_HEADER, value);
    }

    headers
}

fn insert_trace_context(headers: &mut HeaderMap) {
    let context = Span::current().context();
    let otel_span = context.span();
    let span_context = otel_span.span_context();

    if !span_context.is_valid() {
        return;
    }

    let traceparent = format!(
        "00-{}-{}-{:02x}",
        span_context.trace_id(),
        span_context.span_id(),
        span_context.trace_flags().to_u8()
    );
    if let Ok(value) = HeaderValue::from_str(&traceparent) {
        headers.insert(TRACEPARENT_HEADER, value);
    }

    let tracestate = span_context.trace_state().header();
    if !tracestate.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&tracestate) {
            headers.insert(TRACESTATE_HEADER, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_without_active_span_carry_only_ids() {
        let headers = outgoing_headers("req-1", "invoice-42:payment");
        assert!(headers.get(TRACEPARENT_HEADER).is_none());
        assert_eq!(headers.get(REQUEST_ID_HEADER).unwrap(), "req-1");
        assert_eq!(
            headers.get(IDEMPOTENCY_KEY_HEADER).unwrap(),
            "invoice-42:payment"
        );
    }

    #[test]
    fn invalid_header_values_are_dropped() {
        let headers = outgoing_headers("bad\nid", "key");
        assert!(headers.get(REQUEST_ID_HEADER).is_none());
        assert!(headers.get(IDEMPOTENCY_KEY_HEADER).is_some());
    }
}
