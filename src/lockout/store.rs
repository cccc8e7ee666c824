//! Capacity-bounded record store with FIFO eviction.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// An ordered map with a hard capacity.
///
/// When inserting a new key into a full store, the oldest-inserted entry is
/// evicted first. Updating an existing key keeps its original position, so
/// this is a FIFO cache, not an LRU.
#[derive(Debug)]
pub struct BoundedRecordStore<K, V> {
    capacity: usize,
    /// Live entries, tagged with their insertion sequence.
    entries: HashMap<K, (u64, V)>,
    /// Insertion order. May hold stale tags for keys removed since.
    order: VecDeque<(u64, K)>,
    next_seq: u64,
}

impl<K, V> BoundedRecordStore<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a store holding at most `capacity` entries (minimum one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
            next_seq: 0,
        }
    }

    /// Maximum number of entries held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are held.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `key` is held.
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Value for `key`, if held.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|(_, value)| value)
    }

    /// Mutable value for `key`; updating it does not change eviction order.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key).map(|(_, value)| value)
    }

    /// Insert or replace a value.
    ///
    /// Returns the entry evicted to make room, if any. Replacing an existing
    /// key never evicts and never moves the key in eviction order.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some((_, slot)) = self.entries.get_mut(&key) {
            *slot = value;
            return None;
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.evict_oldest()
        } else {
            None
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.push_back((seq, key.clone()));
        self.entries.insert(key, (seq, value));

        evicted
    }

    /// Remove a key, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let (_, value) = self.entries.remove(key)?;
        self.compact_if_sparse();
        Some(value)
    }

    /// Remove and return the oldest-inserted live entry.
    pub fn evict_oldest(&mut self) -> Option<(K, V)> {
        while let Some((seq, key)) = self.order.pop_front() {
            let live = matches!(self.entries.get(&key), Some((live_seq, _)) if *live_seq == seq);
            if live {
                return self.entries.remove(&key).map(|(_, value)| (key, value));
            }
        }
        None
    }

    /// Drop stale order tags once they outnumber live entries.
    fn compact_if_sparse(&mut self) {
        if self.order.len() <= self.capacity.saturating_mul(2) {
            return;
        }
        let entries = &self.entries;
        self.order
            .retain(|(seq, key)| matches!(entries.get(key), Some((live_seq, _)) if live_seq == seq));
    }
}
