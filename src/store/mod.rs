//! Shared key-value store subsystem.
//!
//! # Data Flow
//! ```text
//! security components (rate limit, csrf, ip intel, anomaly, events)
//!     → KvStore trait (atomic counters, get/set with TTL, capped lists)
//!     → redis.rs (fred, multi-instance deployments)
//!     → memory.rs (DashMap, single instance / tests)
//! ```
//!
//! # Design Decisions
//! - All cross-request state lives behind this trait, never in component fields
//! - Counters are incremented atomically by the store itself
//! - Every operation returns `StoreError` instead of panicking; callers apply
//!   their configured failure policy

pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use crate::config::{StoreBackend, StoreConfig};
use crate::resilience::backoff::connect_delay;

/// Errors surfaced by a store backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Backend unreachable or returned an error.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Operation exceeded its time budget.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// Stored value could not be encoded or decoded.
    #[error("stored value could not be decoded: {0}")]
    Serialization(String),
}

/// Result of an atomic fixed-window increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Counter value after this increment.
    pub count: u64,
    /// Time left until the window (and the counter) expires.
    pub ttl: Duration,
}

/// Operations the security pipeline needs from a shared store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Atomically increment `key`, starting a window of `window` on first hit.
    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError>;

    /// Read a string value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a string value that expires after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Write only if absent. Returns `true` if the value was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Remaining lifetime of a key, `None` if missing or persistent.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Remove a key.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Prepend to a list, trimming it to `max_len` entries.
    async fn push_capped(&self, key: &str, value: &str, max_len: usize) -> Result<(), StoreError>;

    /// Read `limit` list entries starting at `offset` (newest first).
    async fn range(&self, key: &str, offset: usize, limit: usize) -> Result<Vec<String>, StoreError>;

    /// Length of a list.
    async fn list_len(&self, key: &str) -> Result<usize, StoreError>;

    /// Name used in logs and metrics.
    fn backend_name(&self) -> &'static str;
}

/// Shared handle used by every component.
pub type SharedStore = Arc<dyn KvStore>;

/// Read and decode a JSON value.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StoreError::Serialization(e.to_string())),
        None => Ok(None),
    }
}

/// Encode and write a JSON value.
pub async fn set_json<T: Serialize>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<(), StoreError> {
    let raw = serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    store.set(key, &raw, ttl).await
}

/// Key namespace shared by all components.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Builds `prefix:category:identifier`.
    pub fn key(&self, category: &str, identifier: &str) -> String {
        let mut key = String::with_capacity(self.prefix.len() + category.len() + identifier.len() + 2);
        key.push_str(&self.prefix);
        key.push(':');
        key.push_str(category);
        key.push(':');
        key.push_str(identifier);
        key
    }
}

/// Open the configured store backend.
pub async fn connect(config: &StoreConfig) -> Result<SharedStore, StoreError> {
    match config.backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store; limits are not shared across instances");
            let store = Arc::new(MemoryStore::new());
            let weak = Arc::downgrade(&store);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(60));
                loop {
                    tick.tick().await;
                    let Some(store) = weak.upgrade() else { break };
                    let removed = store.sweep();
                    if removed > 0 {
                        tracing::debug!(removed, "Swept expired keys");
                    }
                }
            });
            Ok(store)
        }
        StoreBackend::Redis => {
            let attempts = config.connect_attempts.max(1);
            let mut last_err = None;
            for attempt in 1..=attempts {
                let delay = connect_delay(attempt, 200, 5_000);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                match RedisStore::connect(
                    &config.redis_url,
                    Duration::from_millis(config.connect_timeout_ms),
                    Duration::from_millis(config.op_timeout_ms),
                )
                .await
                {
                    Ok(store) => return Ok(Arc::new(store)),
                    Err(e) => {
                        tracing::warn!(attempt, max_attempts = attempts, error = %e, "Redis connection attempt failed");
                        last_err = Some(e);
                    }
                }
            }
            Err(last_err.unwrap_or_else(|| StoreError::Unavailable("no connection attempts made".into())))
        }
    }
}
