//! Fixed-window request counters keyed by (client, path).
//!
//! # Algorithm
//!
//! Each key owns a counter `{count, reset_at}`. A request either starts a
//! fresh window (`count = 1`, `reset_at = now + window`) when the key is
//! absent or its window has passed, or increments the existing count.
//! Requests beyond the quota are rejected but still counted, so flooding a
//! key cannot shorten its window.
//!
//! This is a fixed window, not a sliding one: a client can burst up to twice
//! the quota across a window boundary.
//!
//! # Eviction
//!
//! Expired counters are deleted by `sweep_expired`, which runs both
//! opportunistically inside `check_and_increment` (at most once per sweep
//! interval) and from the background task in `state.rs`. Memory stays bounded
//! by the number of keys active within one window.
//!
//! # Deployment
//!
//! [`InMemoryWindowStore`] is process-local. Behind a load balancer each
//! instance enforces its own quota; a shared store can be plugged in through
//! the [`WindowStore`] trait.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::trace;

use crate::policy::RateLimitPolicy;

/// Wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Composite counter identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    /// Best-effort caller identity (IP or `"unknown"`)
    pub client_id: String,
    /// Request path without the query string
    pub path: String,
}

impl WindowKey {
    pub fn new(client_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            path: path.into(),
        }
    }
}

/// Requests observed in the current window of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCounter {
    pub count: u32,
    /// Milliseconds since the Unix epoch
    pub reset_at_ms: i64,
}

impl WindowCounter {
    #[inline]
    fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.reset_at_ms
    }
}

/// Outcome of one `check_and_increment` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    pub allowed: bool,
    /// Count after this request was recorded
    pub count: u32,
    pub reset_at_ms: i64,
    pub limit: u32,
}

impl WindowDecision {
    /// Requests left in the window, never negative.
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.count)
    }

    /// Whole seconds until the window resets, rounded up, at least 1.
    pub fn retry_after_secs(&self, now_ms: i64) -> u64 {
        let delta_ms = u64::try_from(self.reset_at_ms.saturating_sub(now_ms)).unwrap_or(0);
        delta_ms.div_ceil(1000).max(1)
    }

    /// Window reset as Unix epoch seconds, rounded up.
    pub fn reset_epoch_secs(&self) -> i64 {
        self.reset_at_ms.saturating_add(999).div_euclid(1000)
    }
}

/// Failure of a window store backend.
///
/// The in-memory store never fails; shared stores reached over the network
/// report connectivity problems here.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("window store unavailable: {0}")]
    Unavailable(String),
}

/// Atomic check-and-increment storage for fixed-window counters.
pub trait WindowStore: Send + Sync {
    /// Record one request for `key` under `policy` and decide admission.
    ///
    /// Lookup and update must be a single atomic step with respect to other
    /// calls for the same key.
    fn check_and_increment(
        &self,
        key: &WindowKey,
        policy: &RateLimitPolicy,
        now_ms: i64,
    ) -> Result<WindowDecision, StoreError>;

    /// Delete every counter whose window has passed; returns how many.
    fn sweep_expired(&self, now_ms: i64) -> usize;

    /// Number of live counters.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct StoreInner {
    counters: HashMap<WindowKey, WindowCounter>,
    last_sweep_ms: i64,
}

impl StoreInner {
    fn sweep(&mut self, now_ms: i64) -> usize {
        let before = self.counters.len();
        self.counters.retain(|_, counter| !counter.is_expired(now_ms));
        self.last_sweep_ms = now_ms;
        before - self.counters.len()
    }
}

/// Process-local window store guarded by a single mutex.
pub struct InMemoryWindowStore {
    inner: Mutex<StoreInner>,
    /// Minimum spacing of opportunistic sweeps; 0 sweeps on every call
    sweep_interval_ms: i64,
}

impl InMemoryWindowStore {
    /// Create a store that sweeps inline at most once per `sweep_interval`.
    pub fn new(sweep_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                counters: HashMap::new(),
                last_sweep_ms: i64::MIN,
            }),
            sweep_interval_ms: i64::try_from(sweep_interval.as_millis()).unwrap_or(i64::MAX),
        }
    }

    /// Snapshot of the counter for `key`, if present (expired or not).
    pub fn counter(&self, key: &WindowKey) -> Option<WindowCounter> {
        self.lock().counters.get(key).copied()
    }

    // A panic elsewhere while holding the lock leaves the map consistent
    // (every mutation is a single insert/update), so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryWindowStore {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl WindowStore for InMemoryWindowStore {
    fn check_and_increment(
        &self,
        key: &WindowKey,
        policy: &RateLimitPolicy,
        now_ms: i64,
    ) -> Result<WindowDecision, StoreError> {
        let limit = policy.max_requests;
        let window_ms = i64::try_from(policy.window_ms).unwrap_or(i64::MAX);
        let mut inner = self.lock();

        if now_ms.saturating_sub(inner.last_sweep_ms) >= self.sweep_interval_ms {
            let removed = inner.sweep(now_ms);
            if removed > 0 {
                trace!(removed, "Swept expired rate limit windows");
            }
        }

        let counter = match inner.counters.get_mut(key) {
            Some(counter) if !counter.is_expired(now_ms) => {
                counter.count = counter.count.saturating_add(1);
                *counter
            }
            _ => {
                let fresh = WindowCounter {
                    count: 1,
                    reset_at_ms: now_ms.saturating_add(window_ms),
                };
                inner.counters.insert(key.clone(), fresh);
                fresh
            }
        };

        Ok(WindowDecision {
            allowed: counter.count <= limit,
            count: counter.count,
            reset_at_ms: counter.reset_at_ms,
            limit,
        })
    }

    fn sweep_expired(&self, now_ms: i64) -> usize {
        self.lock().sweep(now_ms)
    }

    fn len(&self) -> usize {
        self.lock().counters.len()
    }
}
