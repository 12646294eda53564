use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::admission::RateLimitRejection;
use crate::window_store::StoreError;

/// Startup and configuration errors.
///
/// These never reach a client: they abort process start (see `main.rs`) or
/// surface from `GateState` construction in embedding applications.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid rate limit policy: {0}")]
    InvalidPolicy(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

/// Per-request failure of the admission gate.
///
/// Every stage of the gate (admission, handler invocation) returns this as a
/// value; `GateError::into_response` is the single place where it becomes a
/// wire-level 429 or 500.
#[derive(Error, Debug)]
pub enum GateError {
    #[error("Rate limit exceeded for {} on {}", .0.client_id, .0.path)]
    RateLimited(RateLimitRejection),

    #[error("Window store failure: {0}")]
    Store(#[from] StoreError),

    #[error("Downstream handler failed: {0}")]
    Downstream(String),

    #[error("Request handling panicked: {0}")]
    Panicked(String),
}

impl GateError {
    /// Whether this is an expected quota rejection rather than a failure.
    pub fn is_rejection(&self) -> bool {
        matches!(self, GateError::RateLimited(_))
    }

    /// Short machine-readable label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            GateError::RateLimited(_) => "rate_limited",
            GateError::Store(_) => "store",
            GateError::Downstream(_) => "downstream",
            GateError::Panicked(_) => "panic",
        }
    }

    /// Convert into the client-facing response.
    ///
    /// Rejections carry retry guidance. Every other variant becomes a generic
    /// 500 whose body holds only the trace id; the error text stays in the
    /// server logs.
    pub fn into_response(self, trace_id: &str) -> Response {
        match self {
            GateError::RateLimited(rejection) => rejection.into_response(),
            GateError::Store(_) | GateError::Downstream(_) | GateError::Panicked(_) => {
                internal_error_response(trace_id)
            }
        }
    }
}

/// Fail-safe error body: the correlation id is all a client gets.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InternalErrorBody<'a> {
    error: &'static str,
    trace_id: &'a str,
}

/// Build the fail-safe 500 response.
pub fn internal_error_response(trace_id: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(InternalErrorBody {
            error: "Internal Server Error",
            trace_id,
        }),
    )
        .into_response()
}
