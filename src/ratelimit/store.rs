//! The atomic counter store contract consumed by the window limiter.

use async_trait::async_trait;
use thiserror::Error;

/// Errors reported by a counter store.
///
/// These are infrastructure faults and are never used to signal that a
/// quota has been exceeded.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Counter store unavailable: {0}")]
    Unavailable(String),
    #[error("Counter store backend error: {0}")]
    Backend(String),
}

/// A shared store offering an atomic increment-and-fetch with expiry.
///
/// Implementations must be safe under concurrent callers incrementing the
/// same key: no increment may be lost, from this process or any other.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` by one and return the post-increment count.
    ///
    /// A key that does not exist (or has expired) is created with a count of
    /// one and an expiry `expiry_after_secs` seconds from now.
    async fn atomic_increment(&self, key: &str, expiry_after_secs: u64) -> Result<u64, StoreError>;
}

#[async_trait]
impl<S: CounterStore + ?Sized> CounterStore for std::sync::Arc<S> {
    async fn atomic_increment(&self, key: &str, expiry_after_secs: u64) -> Result<u64, StoreError> {
        (**self).atomic_increment(key, expiry_after_secs).await
    }
}
