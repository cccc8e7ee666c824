//! In-process counter store.
//!
//! Useful for single-instance deployments and tests. Counts are not shared
//! with other processes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::store::{CounterStore, StoreError};

/// Increments between sweeps of expired keys.
const DEFAULT_PURGE_INTERVAL: u64 = 1024;

/// Expiry used when the requested one does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy)]
struct Slot {
    count: u64,
    expires_at: Instant,
}

/// A `CounterStore` backed by a concurrent hash map.
///
/// Each increment holds the shard lock for its key, so concurrent
/// increments never lose updates. Expired keys restart at one on their
/// next increment, and every `purge_interval` increments the store sweeps
/// out all expired keys, so windows that are never touched again do not
/// accumulate.
#[derive(Debug)]
pub struct MemoryCounterStore {
    slots: DashMap<String, Slot>,
    increments: AtomicU64,
    purge_interval: u64,
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::with_purge_interval(DEFAULT_PURGE_INTERVAL)
    }
}

impl MemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store that sweeps expired keys every `interval` increments.
    pub fn with_purge_interval(interval: u64) -> Self {
        Self {
            slots: DashMap::new(),
            increments: AtomicU64::new(0),
            purge_interval: interval.max(1),
        }
    }

    /// Current count for a key, if present and not expired.
    pub fn get(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        self.slots
            .get(key)
            .filter(|slot| slot.expires_at > now)
            .map(|slot| slot.count)
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.expires_at > now);
        let removed = before.saturating_sub(self.slots.len());
        trace!(removed, "Purged expired window counters");
        removed
    }

    /// Number of keys held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the store holds no keys at all.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn atomic_increment(&self, key: &str, expiry_after_secs: u64) -> Result<u64, StoreError> {
        let now = Instant::now();
        let expires_at = now
            .checked_add(Duration::from_secs(expiry_after_secs))
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);

        let count = {
            let mut slot = self.slots.entry(key.to_string()).or_insert(Slot {
                count: 0,
                expires_at,
            });
            if slot.expires_at <= now {
                slot.count = 0;
                slot.expires_at = expires_at;
            }
            slot.count += 1;
            slot.count
        };

        // The shard guard is released above; `retain` locks every shard.
        let seen = self.increments.fetch_add(1, Ordering::Relaxed) + 1;
        if seen % self.purge_interval == 0 {
            self.purge_expired();
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_increment_returns_post_increment_count() {
        let store = MemoryCounterStore::new();
        assert_eq!(store.atomic_increment("k", 60).await.unwrap(), 1);
        assert_eq!(store.atomic_increment("k", 60).await.unwrap(), 2);
        assert_eq!(store.atomic_increment("other", 60).await.unwrap(), 1);
        assert_eq!(store.get("k"), Some(2));
    }

    #[tokio::test]
    async fn test_expired_key_restarts() {
        let store = MemoryCounterStore::new();
        store.atomic_increment("k", 0).await.unwrap();
        store.atomic_increment("k", 0).await.unwrap();
        assert_eq!(store.get("k"), None);

        assert_eq!(store.atomic_increment("k", 60).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryCounterStore::new();
        store.atomic_increment("stale", 0).await.unwrap();
        store.atomic_increment("live", 60).await.unwrap();
        assert_eq!(store.len(), 2);

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("live"), Some(1));
    }

    #[tokio::test]
    async fn test_stale_windows_are_reclaimed_without_explicit_purge() {
        let store = MemoryCounterStore::with_purge_interval(100);
        for window in 0..1000 {
            let key = format!("api#10.0.0.1#{}", window);
            store.atomic_increment(&key, 0).await.unwrap();
        }
        assert!(store.len() <= 100, "len was {}", store.len());
    }

    #[tokio::test]
    async fn test_live_keys_survive_sweeps() {
        let store = MemoryCounterStore::with_purge_interval(2);
        store.atomic_increment("live", 60).await.unwrap();
        for i in 0..10 {
            store.atomic_increment(&format!("stale{}", i), 0).await.unwrap();
        }
        assert_eq!(store.get("live"), Some(1));
    }

    #[tokio::test]
    async fn test_huge_expiry_does_not_panic() {
        let store = MemoryCounterStore::new();
        assert_eq!(store.atomic_increment("k", u64::MAX).await.unwrap(), 1);
        assert_eq!(store.atomic_increment("k", u64::MAX).await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryCounterStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    store.atomic_increment("shared", 60).await.unwrap();
                }
            }));
        }
        for handle in futures::future::join_all(handles).await {
            handle.unwrap();
        }

        assert_eq!(store.get("shared"), Some(800));
    }
}
