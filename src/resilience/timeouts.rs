//! Timeout enforcement for store operations.
//!
//! Timed-out calls surface as `StoreError::Timeout` so callers can apply
//! their failure policy instead of waiting on a hung dependency.

use std::future::Future;
use std::time::Duration;

use crate::store::StoreError;

/// Run `fut` with a deadline.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}
