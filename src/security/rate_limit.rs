//! Distributed fixed-window rate limiter.
//!
//! # Responsibilities
//! - Count requests per (identity, endpoint class) in the shared store
//! - Produce a decision carrying the `X-RateLimit-*` values
//!
//! # Design Decisions
//! - Counters live in the store and are incremented atomically there, so
//!   every instance sees the same bucket
//! - The store's window TTL is the source of truth for the reset time
//! - Store failures are returned to the caller, which applies the
//!   configured failure policy

use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue};
use serde::Serialize;

use crate::config::RateLimitConfig;
use crate::security::endpoint::EndpointLimit;
use crate::security::identity::ClientIdentity;
use crate::security::unix_millis;
use crate::store::{KeySpace, SharedStore, StoreError};

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    /// Whether the request is allowed.
    pub allowed: bool,
    /// Endpoint class the request was counted against.
    pub class: String,
    /// Maximum requests allowed in the window.
    pub limit: u32,
    /// Remaining requests in the current window.
    pub remaining: u32,
    /// Unix timestamp (seconds) when the window resets.
    pub reset_at: u64,
    /// Seconds to wait before retrying (0 if allowed).
    pub retry_after: u64,
}

impl RateLimitDecision {
    /// Write `X-RateLimit-Limit`, `-Remaining` and `-Reset`.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(self.remaining));
        headers.insert("x-ratelimit-reset", HeaderValue::from(self.reset_at));
    }
}

/// Shared-store rate limiter.
#[derive(Clone)]
pub struct RateLimiter {
    store: SharedStore,
    keys: KeySpace,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: SharedStore, keys: KeySpace, config: RateLimitConfig) -> Self {
        Self { store, keys, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Whether this identity is checked at all.
    pub fn applies_to(&self, identity: &ClientIdentity) -> bool {
        self.config.enabled && !self.config.allowlist.contains(identity.key())
    }

    /// Count one request against the endpoint's bucket.
    ///
    /// The request that takes the counter past the limit, and every one after
    /// it in the same window, is denied with `remaining = 0`.
    #[tracing::instrument(level = "debug", skip(self, identity), fields(client = %identity.key(), class = %endpoint.class))]
    pub async fn check_rate_limit(
        &self,
        identity: &ClientIdentity,
        endpoint: &EndpointLimit,
    ) -> Result<RateLimitDecision, StoreError> {
        let limit = endpoint.limit.requests;
        let window = Duration::from_secs(endpoint.limit.window_secs);
        let key = self.keys.key(&format!("rl:{}", endpoint.class), identity.key());

        let counted = self.store.incr_window(&key, window).await?;

        // A missing TTL would leave the counter without a window; treat it as a full window.
        let ttl = if counted.ttl.is_zero() { window } else { counted.ttl };
        let now_ms = unix_millis();
        let reset_at = (now_ms + ttl.as_millis() as u64).div_ceil(1000);

        let allowed = counted.count <= u64::from(limit);
        let remaining = u64::from(limit).saturating_sub(counted.count) as u32;
        let retry_after = if allowed {
            0
        } else {
            ttl.as_millis().div_ceil(1000).max(1) as u64
        };

        Ok(RateLimitDecision {
            allowed,
            class: endpoint.class.clone(),
            limit,
            remaining: if allowed { remaining } else { 0 },
            reset_at,
            retry_after,
        })
    }
}
