//! Rate-limit policy table and longest-prefix resolution.
//!
//! # Static Table
//!
//! | Prefix                     | Quota | Window | Override |
//! |----------------------------|-------|--------|----------|
//! | `/api/`                    | 100   | 60s    | yes      |
//! | `/api/auth`                | 5     | 60s    | yes      |
//! | `/api/billing`             | 10    | 60s    | yes      |
//! | `/api/admin`               | 30    | 60s    | yes      |
//! | `/api/recipes/generate`    | 10    | 60s    | yes      |
//! | `/api/meal-plans/generate` | 5     | 60s    | yes      |
//! | `/api/webhooks`            | 1000  | 60s    | exempt   |
//!
//! `/api/` is the catch-all for API traffic. Paths outside every prefix
//! (pages, static assets, `/health`) are not limited.
//!
//! # Global Override
//!
//! When both `RATE_LIMIT_REQUESTS` and `RATE_LIMIT_WINDOW_SECONDS` are set,
//! every entry not marked exempt takes that quota and window. Payment
//! processor webhooks are exempt: their delivery rate is not under our
//! control.
//!
//! # Resolution
//!
//! Policies are sorted by descending prefix length when the table is built,
//! so `resolve` returns the first literal prefix match, which is the most
//! specific one.

use std::collections::HashSet;
use std::time::Duration;

use crate::config::Config;
use crate::error::{AppError, AppResult};

/// Quota applied to every path starting with `path_prefix`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Literal path prefix, e.g. `/api/auth`
    pub path_prefix: String,
    /// Requests allowed per window
    pub max_requests: u32,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Keep this entry's values when a global override is configured
    pub override_exempt: bool,
}

impl RateLimitPolicy {
    /// Create a policy allowing `max_requests` per `window`.
    pub fn new(path_prefix: impl Into<String>, max_requests: u32, window: Duration) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            max_requests,
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            override_exempt: false,
        }
    }

    /// Mark this policy as exempt from the global override.
    pub fn exempt_from_override(mut self) -> Self {
        self.override_exempt = true;
        self
    }

    /// Window length as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Whether this policy governs `path`.
    #[inline]
    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(self.path_prefix.as_str())
    }
}

/// Global quota/window replacing every non-exempt table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyOverride {
    pub max_requests: u32,
    pub window_secs: u64,
}

/// Built-in policy table: (prefix, requests, window seconds, override exempt).
const DEFAULT_POLICIES: [(&str, u32, u64, bool); 7] = [
    ("/api/", 100, 60, false),
    ("/api/auth", 5, 60, false),
    ("/api/billing", 10, 60, false),
    ("/api/admin", 30, 60, false),
    ("/api/recipes/generate", 10, 60, false),
    ("/api/meal-plans/generate", 5, 60, false),
    ("/api/webhooks", 1000, 60, true),
];

/// The built-in policies, unsorted.
pub fn default_policies() -> Vec<RateLimitPolicy> {
    DEFAULT_POLICIES
        .iter()
        .map(|&(prefix, requests, window_secs, exempt)| {
            let policy = RateLimitPolicy::new(prefix, requests, Duration::from_secs(window_secs));
            if exempt {
                policy.exempt_from_override()
            } else {
                policy
            }
        })
        .collect()
}

/// Immutable, resolution-ordered set of rate-limit policies.
///
/// Constructed once at startup and shared by reference with the
/// admission controller.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    /// Sorted by descending prefix length
    policies: Vec<RateLimitPolicy>,
}

impl PolicyTable {
    /// Build a table from arbitrary policies.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidPolicy` if a prefix is empty or does not
    /// start with `/`, a quota or window is zero, or two policies share a
    /// prefix.
    pub fn new(mut policies: Vec<RateLimitPolicy>) -> AppResult<Self> {
        let mut seen = HashSet::with_capacity(policies.len());

        for policy in &policies {
            if !policy.path_prefix.starts_with('/') {
                return Err(AppError::InvalidPolicy(format!(
                    "prefix '{}' must start with '/'",
                    policy.path_prefix
                )));
            }
            if policy.max_requests == 0 {
                return Err(AppError::InvalidPolicy(format!(
                    "prefix '{}' has a zero request quota",
                    policy.path_prefix
                )));
            }
            if policy.window_ms == 0 {
                return Err(AppError::InvalidPolicy(format!(
                    "prefix '{}' has a zero window",
                    policy.path_prefix
                )));
            }
            if !seen.insert(policy.path_prefix.as_str()) {
                return Err(AppError::InvalidPolicy(format!(
                    "duplicate prefix '{}'",
                    policy.path_prefix
                )));
            }
        }

        // Equal lengths cannot both match the same path, the secondary key only
        // keeps iteration order reproducible.
        policies.sort_by(|a, b| {
            b.path_prefix
                .len()
                .cmp(&a.path_prefix.len())
                .then_with(|| a.path_prefix.cmp(&b.path_prefix))
        });

        Ok(Self { policies })
    }

    /// Build the built-in table, applying `global_override` if given.
    pub fn with_defaults(global_override: Option<PolicyOverride>) -> AppResult<Self> {
        let mut policies = default_policies();
        if let Some(ov) = global_override {
            apply_override(&mut policies, ov);
        }
        Self::new(policies)
    }

    /// Build the table described by the application configuration.
    pub fn from_config(config: &Config) -> AppResult<Self> {
        Self::with_defaults(config.rate_limit_override)
    }

    /// Find the most specific policy governing `path`.
    ///
    /// `path` must not include the query string.
    pub fn resolve(&self, path: &str) -> Option<&RateLimitPolicy> {
        self.policies.iter().find(|policy| policy.matches(path))
    }

    /// Policies in resolution order.
    pub fn policies(&self) -> &[RateLimitPolicy] {
        &self.policies
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

/// Replace quota and window of every non-exempt policy.
pub fn apply_override(policies: &mut [RateLimitPolicy], ov: PolicyOverride) {
    let window_ms = ov.window_secs.saturating_mul(1000);
    for policy in policies.iter_mut().filter(|p| !p.override_exempt) {
        policy.max_requests = ov.max_requests;
        policy.window_ms = window_ms;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn policy(prefix: &str, requests: u32) -> RateLimitPolicy {
        RateLimitPolicy::new(prefix, requests, Duration::from_secs(60))
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table =
            PolicyTable::new(vec![policy("/api/", 100), policy("/api/billing", 10)]).unwrap();

        let resolved = table.resolve("/api/billing/checkout").unwrap();
        assert_eq!(resolved.path_prefix, "/api/billing");
        assert_eq!(resolved.max_requests, 10);
        assert_eq!(resolved.window_ms, 60_000);
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let table =
            PolicyTable::new(vec![policy("/api/billing", 10), policy("/api/", 100)]).unwrap();

        assert_eq!(
            table.resolve("/api/billing").unwrap().path_prefix,
            "/api/billing"
        );
        assert_eq!(table.resolve("/api/recipes").unwrap().path_prefix, "/api/");
    }

    #[test]
    fn test_catch_all_fallback() {
        let table = PolicyTable::with_defaults(None).unwrap();
        assert_eq!(
            table.resolve("/api/pantry/items").unwrap().path_prefix,
            "/api/"
        );
    }

    #[test]
    fn test_no_match_means_no_limit() {
        let table = PolicyTable::with_defaults(None).unwrap();
        assert!(table.resolve("/health").is_none());
        assert!(table.resolve("/dashboard").is_none());
        // "/api" without the trailing slash is not under the catch-all
        assert!(table.resolve("/api").is_none());
    }

    #[test]
    fn test_prefix_match_is_literal() {
        let table = PolicyTable::with_defaults(None).unwrap();
        // Literal string prefix, not path-segment aware
        assert_eq!(
            table.resolve("/api/authorize").unwrap().path_prefix,
            "/api/auth"
        );
    }

    #[test]
    fn test_resolution_order_sorted_by_length() {
        let table = PolicyTable::with_defaults(None).unwrap();
        let lengths: Vec<usize> = table
            .policies()
            .iter()
            .map(|p| p.path_prefix.len())
            .collect();
        let mut sorted = lengths.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(lengths, sorted);
    }

    #[test]
    fn test_duplicate_prefix_rejected() {
        let result = PolicyTable::new(vec![policy("/api/", 100), policy("/api/", 50)]);
        assert!(matches!(result, Err(AppError::InvalidPolicy(_))));
    }

    #[test]
    fn test_zero_quota_rejected() {
        let result = PolicyTable::new(vec![policy("/api/", 0)]);
        assert!(result.unwrap_err().to_string().contains("zero request quota"));
    }

    #[test]
    fn test_zero_window_rejected() {
        let result = PolicyTable::new(vec![RateLimitPolicy::new("/api/", 5, Duration::ZERO)]);
        assert!(result.unwrap_err().to_string().contains("zero window"));
    }

    #[test]
    fn test_prefix_must_be_absolute() {
        let result = PolicyTable::new(vec![policy("api/", 5)]);
        assert!(matches!(result, Err(AppError::InvalidPolicy(_))));
    }

    #[test]
    fn test_global_override_replaces_non_exempt() {
        let table = PolicyTable::with_defaults(Some(PolicyOverride {
            max_requests: 7,
            window_secs: 30,
        }))
        .unwrap();

        for policy in table.policies() {
            if policy.path_prefix == "/api/webhooks" {
                assert_eq!(policy.max_requests, 1000);
                assert_eq!(policy.window_ms, 60_000);
            } else {
                assert_eq!(policy.max_requests, 7);
                assert_eq!(policy.window_ms, 30_000);
            }
        }
    }

    #[test]
    fn test_empty_table_resolves_nothing() {
        let table = PolicyTable::default();
        assert!(table.is_empty());
        assert!(table.resolve("/api/auth").is_none());
    }
}
