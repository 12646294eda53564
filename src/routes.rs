//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack (applied in order)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │       Gate       │ ← trace, 429, security headers, fail-safe 500
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging (with trace_id)
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │    Body Limit    │ ← 413 if over MAX_REQUEST_BODY_SIZE
//! └────────┬─────────┘
//!          │
//!          ▼
//!      Handler
//! ```
//!
//! # Route Groups
//!
//! - `/health`, `/ready` - Health & monitoring (no rate limit policy)
//! - everything in the embedding application's router
//! - fallback - 404 JSON

use axum::Router;
use axum::body::Body;
use axum::extract::DefaultBodyLimit;
use axum::http::Request;
use axum::routing::get;
use tower_http::trace::TraceLayer;
use tracing::{info, info_span};

use crate::handlers;
use crate::middleware::TraceContextExt;
use crate::state::GateState;

/// Build the router: support routes plus `app`, all behind the gate.
///
/// `app` must already have its state applied. The 404 fallback replaces any
/// fallback set on `app`.
///
/// # Example
///
/// ```rust,ignore
/// let api = Router::new().route("/api/recipes", get(list_recipes));
/// let router = build_router(state, api);
/// ```
pub fn build_router(state: GateState, app: Router) -> Router {
    let config = &state.config;

    let support = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .with_state(state.clone());

    let mut router = support.merge(app).fallback(handlers::not_found);

    // =========================================================================
    // Apply Middleware Stack (order matters - applied bottom to top)
    // =========================================================================

    // 1. Request body size limit (prevents DoS via large payloads)
    info!(
        max_size_mb = config.max_request_body_size / (1024 * 1024),
        "Request body size limit configured"
    );
    router = router.layer(DefaultBodyLimit::max(config.max_request_body_size));

    // 2. Tracing; runs inside the gate so the trace id is already assigned
    router = router.layer(TraceLayer::new_for_http().make_span_with(
        |req: &Request<Body>| {
            info_span!(
                "http",
                method = %req.method(),
                path = %req.uri().path(),
                trace_id = req.trace_id().unwrap_or("-"),
            )
        },
    ));

    // 3. Gate (outermost)
    router.layer(state.gate_layer())
}
