//! Store-backed fixed-window rate limiter.
//!
//! Every instance increments the same store key for a given caller and
//! window, so the decision is consistent across the whole fleet. The store's
//! atomic increment is the only synchronisation; the limiter holds no state
//! of its own beyond its configuration.

use std::net::IpAddr;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, trace};

use super::key::{is_valid_scope, RateWindowKey};
use super::store::CounterStore;
use crate::config::WindowLimiterConfig;
use crate::error::{Result, TurnstileError};

/// Outcome of a window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    /// Whether the event is within the quota.
    pub allowed: bool,
    /// Post-increment count for this window (also returned when denied).
    pub count: u64,
    /// The per-window threshold.
    pub limit: u64,
    /// Events left in this window.
    pub remaining: u64,
    /// When the current window ends.
    pub resets_at: Option<DateTime<Utc>>,
}

impl WindowDecision {
    /// Denial for a caller that could not be identified. No store call is made.
    fn unidentified(limit: u64) -> Self {
        Self {
            allowed: false,
            count: 0,
            limit,
            remaining: 0,
            resets_at: None,
        }
    }
}

/// A fixed-window limiter whose counters live in a shared [`CounterStore`].
pub struct DistributedWindowLimiter<S: CounterStore> {
    store: S,
    config: WindowLimiterConfig,
}

impl<S: CounterStore> DistributedWindowLimiter<S> {
    /// Create a new limiter over `store`.
    pub fn new(store: S, config: WindowLimiterConfig) -> Self {
        Self { store, config }
    }

    /// Get the limiter configuration.
    pub fn config(&self) -> &WindowLimiterConfig {
        &self.config
    }

    /// Get the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Count one event for `identifier` in `scope` and decide whether it is allowed.
    ///
    /// Performs exactly one store increment. A store failure is returned as
    /// [`TurnstileError::Store`](crate::error::TurnstileError::Store), never as
    /// a denial. An empty identifier is denied without touching the store.
    /// A scope that is empty or contains `#` is rejected with
    /// [`TurnstileError::Config`].
    pub async fn check(
        &self,
        scope: &str,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<WindowDecision> {
        validate_scope(scope)?;
        let limit = self.config.threshold;
        if identifier.trim().is_empty() {
            debug!(scope = %scope, "Denying event from unidentified caller");
            return Ok(WindowDecision::unidentified(limit));
        }

        let window_secs = self.config.window_secs.clamp(1, i64::MAX as u64);
        let now_secs = now.timestamp();
        let key = RateWindowKey::for_instant(scope, identifier, now_secs, window_secs);
        let window_end = key.window_start.saturating_add(window_secs as i64);
        let expiry_after_secs = window_end
            .saturating_sub(now_secs)
            .max(1)
            .unsigned_abs()
            .saturating_add(self.config.expiry_margin_secs);

        trace!(
            key = %key,
            expiry_after_secs,
            "Checking window rate limit"
        );

        let count = self
            .store
            .atomic_increment(&key.to_store_key(), expiry_after_secs)
            .await?;

        let allowed = count <= limit;
        if !allowed {
            debug!(
                key = %key,
                count,
                limit,
                "Window rate limit exceeded"
            );
        }

        Ok(WindowDecision {
            allowed,
            count,
            limit,
            remaining: limit.saturating_sub(count),
            resets_at: Utc.timestamp_opt(window_end, 0).single(),
        })
    }

    /// Check using the current wall-clock time.
    pub async fn check_now(&self, scope: &str, identifier: &str) -> Result<WindowDecision> {
        self.check(scope, identifier, Utc::now()).await
    }

    /// Check a caller by network address; an unknown address is denied.
    pub async fn check_addr(
        &self,
        scope: &str,
        addr: Option<IpAddr>,
        now: DateTime<Utc>,
    ) -> Result<WindowDecision> {
        validate_scope(scope)?;
        match addr {
            Some(addr) => self.check(scope, &addr.to_string(), now).await,
            None => {
                debug!(scope = %scope, "Denying event with no caller address");
                Ok(WindowDecision::unidentified(self.config.threshold))
            }
        }
    }
}

fn validate_scope(scope: &str) -> Result<()> {
    if is_valid_scope(scope) {
        Ok(())
    } else {
        Err(TurnstileError::Config(format!(
            "rate limit scope {:?} must be non-empty and must not contain '#'",
            scope
        )))
    }
}
