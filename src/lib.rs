//! # Meal-Plan Admission Gate
//!
//! Request admission control and trace propagation for the meal-planning
//! API, packaged as an axum/tower layer:
//!
//! - **Rate Limiting**: Fixed-window quotas per client and path, resolved
//!   from a longest-prefix policy table
//! - **Tracing**: One trace and gate span per request, finished exactly once
//!   on every exit path, with the id echoed in `X-Trace-Id`
//! - **Security Headers**: CSP, frame, sniffing and referrer policies, plus
//!   HSTS in production-like environments
//! - **Fail-Safe Errors**: Handler errors and panics become a 500 that only
//!   carries the trace id
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  GateLayer (trace → admission → handler → headers/metrics)  │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │  AdmissionController         │  TraceOrchestrator           │
//! │  PolicyTable + WindowStore   │  TraceStore                  │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │  Telemetry (MetricsSink, StructuredLogger)                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use axum::Router;
//! use axum::routing::get;
//! use mealplan_gate::{Config, GateState, build_router};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let state = GateState::new(config)?;
//!
//!     let api = Router::new().route("/api/recipes", get(|| async { "[]" }));
//!     let app = build_router(state.clone(), api);
//!
//!     // Serve `app` with `into_make_service_with_connect_info::<SocketAddr>()`...
//!     state.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Rate Limit Configuration
//!
//! Override every policy uniformly:
//! ```bash
//! RATE_LIMIT_REQUESTS=20 RATE_LIMIT_WINDOW_SECONDS=60 cargo run
//! ```

pub mod admission;
pub mod config;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod policy;
pub mod routes;
pub mod security_headers;
pub mod state;
pub mod telemetry;
pub mod trace;
pub mod utils;
pub mod window_store;

// Re-exports for convenience
pub use admission::{AdmissionController, AdmissionResult, RateLimitHeaders, RateLimitRejection};
pub use config::{Config, Environment};
pub use error::{AppError, AppResult, GateError};
pub use middleware::{GateLayer, TraceContext};
pub use policy::{PolicyTable, RateLimitPolicy};
pub use routes::build_router;
pub use state::{GateState, GateStateBuilder};
pub use telemetry::{Telemetry, TelemetryError};
pub use trace::{TraceOrchestrator, TraceStatus};
pub use window_store::{InMemoryWindowStore, WindowStore};
