//! HTTP middleware: the admission gate and its request helpers.
//!
//! - **Gate**: Trace, admission control, security headers and fail-safe
//!   error handling in one outermost layer
//! - **Correlation**: Inbound correlation ids and the `X-Trace-Id` header
//! - **Client IP**: Rate-limit key extraction with trusted proxy validation
//!
//! # Architecture
//!
//! ```text
//! Request → Gate ─┬─► 429 Too Many Requests (X-RateLimit-*, Retry-After)
//!                 ├─► Handler → Response (+ security headers, X-Trace-Id)
//!                 └─► 500 {error, traceId} on handler error or panic
//! ```

pub mod correlation;
pub mod gate;
pub mod ip;

pub use correlation::{
    CORRELATION_HEADERS, PARENT_SPAN_HEADER, TRACE_ID_HEADER, TraceContext, TraceContextExt,
};
pub use gate::{GateLayer, GateService};
pub use ip::{CidrRange, TrustedProxyConfig, UNKNOWN_IP, extract_client_ip};
