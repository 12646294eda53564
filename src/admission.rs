//! Admission control: policy resolution plus the window store.
//!
//! # Response Headers
//!
//! When a policy governs the path, every response carries:
//! - `X-RateLimit-Limit`: Quota of the resolved policy
//! - `X-RateLimit-Remaining`: Requests left in the current window
//! - `X-RateLimit-Reset`: Window reset as Unix epoch seconds
//!
//! On rate limit exceeded (429) additionally:
//! - `Retry-After`: Seconds until the window resets (at least 1)
//!
//! Paths without a policy get none of these headers.

use std::sync::Arc;

use axum::Json;
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;

use crate::error::GateError;
use crate::logging::LogLevel;
use crate::metrics::names;
use crate::policy::PolicyTable;
use crate::telemetry::Telemetry;
use crate::window_store::{StoreError, WindowKey, WindowStore, now_ms};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Log category for rejections.
const SECURITY_CATEGORY: &str = "security";

/// The three `X-RateLimit-*` values for one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    pub reset_epoch_secs: i64,
}

impl RateLimitHeaders {
    /// Set (overwriting) the rate-limit headers on `headers`.
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.reset_epoch_secs));
    }
}

/// A request refused because its window is exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRejection {
    pub client_id: String,
    pub path: String,
    /// `remaining` is always 0
    pub headers: RateLimitHeaders,
    pub retry_after_secs: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RejectionBody {
    error: &'static str,
    retry_after: u64,
}

impl IntoResponse for RateLimitRejection {
    fn into_response(self) -> Response {
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(RejectionBody {
                error: "Too Many Requests",
                retry_after: self.retry_after_secs,
            }),
        )
            .into_response();

        let headers = response.headers_mut();
        headers.insert(RETRY_AFTER, HeaderValue::from(self.retry_after_secs));
        self.headers.apply(headers);
        response
    }
}

/// Outcome of [`AdmissionController::admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionResult {
    /// No policy governs the path (or limiting is disabled)
    Unlimited,
    /// Within quota; merge the headers into the downstream response
    Allowed(RateLimitHeaders),
    /// Over quota; answer 429 without calling the handler
    Rejected(RateLimitRejection),
}

impl AdmissionResult {
    pub fn allowed(&self) -> bool {
        !matches!(self, AdmissionResult::Rejected(_))
    }

    pub fn headers(&self) -> Option<&RateLimitHeaders> {
        match self {
            AdmissionResult::Unlimited => None,
            AdmissionResult::Allowed(headers) => Some(headers),
            AdmissionResult::Rejected(rejection) => Some(&rejection.headers),
        }
    }

    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            AdmissionResult::Rejected(rejection) => Some(rejection.retry_after_secs),
            _ => None,
        }
    }

    /// Turn a rejection into `GateError::RateLimited` so the gate can `?` it.
    pub fn into_result(self) -> Result<Option<RateLimitHeaders>, GateError> {
        match self {
            AdmissionResult::Unlimited => Ok(None),
            AdmissionResult::Allowed(headers) => Ok(Some(headers)),
            AdmissionResult::Rejected(rejection) => Err(GateError::RateLimited(rejection)),
        }
    }
}

/// Decides whether a request may proceed.
#[derive(Clone)]
pub struct AdmissionController {
    policies: Arc<PolicyTable>,
    store: Arc<dyn WindowStore>,
    telemetry: Telemetry,
    enabled: bool,
}

impl AdmissionController {
    pub fn new(policies: Arc<PolicyTable>, store: Arc<dyn WindowStore>, telemetry: Telemetry) -> Self {
        Self {
            policies,
            store,
            telemetry,
            enabled: true,
        }
    }

    /// Admit every request without touching the store.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    pub fn store(&self) -> &Arc<dyn WindowStore> {
        &self.store
    }

    /// Check and record one request at the current time.
    pub fn admit(
        &self,
        client_id: &str,
        path: &str,
        user_agent: &str,
    ) -> Result<AdmissionResult, StoreError> {
        self.admit_at(client_id, path, user_agent, now_ms())
    }

    /// Check and record one request at `now_ms`.
    ///
    /// # Errors
    ///
    /// Propagates window store failures; the gate answers those with a 500.
    pub fn admit_at(
        &self,
        client_id: &str,
        path: &str,
        user_agent: &str,
        now_ms: i64,
    ) -> Result<AdmissionResult, StoreError> {
        if !self.enabled {
            return Ok(AdmissionResult::Unlimited);
        }
        let Some(policy) = self.policies.resolve(path) else {
            return Ok(AdmissionResult::Unlimited);
        };

        let key = WindowKey::new(client_id, path);
        let decision = self.store.check_and_increment(&key, policy, now_ms)?;
        let headers = RateLimitHeaders {
            limit: decision.limit,
            remaining: decision.remaining(),
            reset_epoch_secs: decision.reset_epoch_secs(),
        };

        if decision.allowed {
            return Ok(AdmissionResult::Allowed(headers));
        }

        let retry_after_secs = decision.retry_after_secs(now_ms);
        self.telemetry.counter(
            names::RATE_LIMIT_EXCEEDED,
            1,
            &[
                ("path", path.to_string()),
                ("client", client_id.to_string()),
                ("user_agent", user_agent.to_string()),
            ],
        );
        self.telemetry.log(
            LogLevel::Warn,
            "Rate limit exceeded",
            &json!({
                "clientId": client_id,
                "path": path,
                "userAgent": user_agent,
                "policy": policy.path_prefix,
                "limit": decision.limit,
                "count": decision.count,
                "retryAfter": retry_after_secs,
            }),
            SECURITY_CATEGORY,
        );

        Ok(AdmissionResult::Rejected(RateLimitRejection {
            client_id: client_id.to_string(),
            path: path.to_string(),
            headers,
            retry_after_secs,
        }))
    }
}
