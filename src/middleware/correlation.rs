//! Correlation headers for distributed tracing.
//!
//! # Inbound
//!
//! - `X-Correlation-Id`, then `X-Request-Id`: continue an upstream trace
//! - `X-Parent-Span-Id`: the caller's span, recorded as the trace parent
//!
//! Values that are not valid trace ids are ignored and a fresh UUIDv4 is used.
//!
//! # Outbound
//!
//! The gate sets `X-Trace-Id` on the request it forwards (so handlers and
//! downstream calls can read it) and on every response.
//!
//! ```bash
//! curl -H "X-Correlation-Id: my-correlation-id" http://localhost:3000/health
//! ```

use axum::http::{HeaderName, Request};

use crate::trace::is_valid_trace_id;

/// Header carrying the trace id on requests and responses.
pub const TRACE_ID_HEADER: HeaderName = HeaderName::from_static("x-trace-id");

/// Inbound correlation headers, in priority order.
pub const CORRELATION_HEADERS: [&str; 2] = ["x-correlation-id", "x-request-id"];

/// Inbound header naming the caller's span.
pub const PARENT_SPAN_HEADER: &str = "x-parent-span-id";

/// Trace identity of the request, stored as a request extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    /// The gate's own span
    pub span_id: String,
}

/// First inbound correlation id that is a valid trace id.
///
/// An invalid `X-Correlation-Id` falls through to `X-Request-Id`.
pub fn inbound_correlation_id<B>(req: &Request<B>) -> Option<&str> {
    CORRELATION_HEADERS
        .iter()
        .find_map(|name| header_str(req, name).filter(|id| is_valid_trace_id(id)))
}

/// Inbound parent span id, if valid.
pub fn inbound_parent_span_id<B>(req: &Request<B>) -> Option<&str> {
    header_str(req, PARENT_SPAN_HEADER).filter(|id| is_valid_trace_id(id))
}

fn header_str<'a, B>(req: &'a Request<B>, name: &str) -> Option<&'a str> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Extension trait to read the trace identity set by the gate.
pub trait TraceContextExt {
    /// The trace id assigned to this request.
    fn trace_id(&self) -> Option<&str>;
}

impl<B> TraceContextExt for Request<B> {
    fn trace_id(&self) -> Option<&str> {
        self.extensions()
            .get::<TraceContext>()
            .map(|ctx| ctx.trace_id.as_str())
    }
}
