//! In-memory failed-attempt tracker with time-boxed lockout.
//!
//! Each tracker owns its own bounded record store, so independent trackers
//! (per tenant, per endpoint) can coexist and tests can start from a fresh
//! instance. There is no background sweep: an elapsed lockout is noticed the
//! next time its identifier is touched.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::store::BoundedRecordStore;
use crate::config::LockoutConfig;

/// Attempt history for one identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutRecord {
    /// Attempts counted since the record (re)started.
    pub attempt_count: u32,
    /// When the record (re)started.
    pub window_started_at: DateTime<Utc>,
    /// End of the current lockout, if one was imposed.
    pub locked_until: Option<DateTime<Utc>>,
}

impl LockoutRecord {
    fn first_attempt(now: DateTime<Utc>) -> Self {
        Self {
            attempt_count: 1,
            window_started_at: now,
            locked_until: None,
        }
    }

    /// Whether a lockout is in force at `now`.
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.locked_until, Some(until) if until > now)
    }

    /// Whether a lockout was imposed and has since run out.
    fn lockout_elapsed_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.locked_until, Some(until) if until <= now)
    }
}

/// Outcome of recording an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptDecision {
    pub allowed: bool,
    pub locked_until: Option<DateTime<Utc>>,
}

/// Read-only view of an identifier's lockout state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutStatus {
    pub is_locked: bool,
    pub remaining_attempts: u32,
    pub lockout_ends_at: Option<DateTime<Utc>>,
}

/// Tracks failed attempts per identifier and locks out repeat offenders.
///
/// Storage is capped at `max_entries`; a never-seen identifier arriving at a
/// full tracker evicts the oldest-inserted record.
pub struct LocalLockoutTracker {
    config: LockoutConfig,
    records: Mutex<BoundedRecordStore<String, LockoutRecord>>,
}

impl LocalLockoutTracker {
    /// Create a new tracker.
    pub fn new(config: LockoutConfig) -> Self {
        let records = BoundedRecordStore::new(config.max_entries);
        Self {
            config,
            records: Mutex::new(records),
        }
    }

    /// Get the tracker configuration.
    pub fn config(&self) -> &LockoutConfig {
        &self.config
    }

    /// Count one attempt for `identifier` and decide whether it may proceed.
    ///
    /// An attempt made while locked out is denied and not counted. Once a
    /// lockout has run out, the next attempt starts a fresh count at one
    /// instead of adding to the old one, so the caller is not locked out
    /// again on their first try.
    pub fn record_attempt(&self, identifier: &str, now: DateTime<Utc>) -> AttemptDecision {
        let mut records = self.records.lock();
        let key = identifier.to_string();

        let record = match records.get_mut(&key) {
            Some(record) if record.is_locked_at(now) => {
                trace!(identifier = %identifier, "Attempt while locked out");
                return AttemptDecision {
                    allowed: false,
                    locked_until: record.locked_until,
                };
            }
            Some(record) if record.lockout_elapsed_at(now) => {
                trace!(identifier = %identifier, "Lockout elapsed, restarting count");
                *record = LockoutRecord::first_attempt(now);
                *record
            }
            Some(record) => {
                record.attempt_count = record.attempt_count.saturating_add(1);
                *record
            }
            None => {
                let record = LockoutRecord::first_attempt(now);
                if let Some((evicted, _)) = records.insert(key.clone(), record) {
                    debug!(
                        evicted = %evicted,
                        capacity = records.capacity(),
                        "Evicted oldest lockout record"
                    );
                }
                record
            }
        };

        if record.attempt_count <= self.config.threshold {
            return AttemptDecision {
                allowed: true,
                locked_until: None,
            };
        }

        let locked_until = now + self.config.lockout_duration();
        if let Some(record) = records.get_mut(&key) {
            record.locked_until = Some(locked_until);
        }
        debug!(
            identifier = %identifier,
            attempts = record.attempt_count,
            locked_until = %locked_until,
            "Identifier locked out"
        );

        AttemptDecision {
            allowed: false,
            locked_until: Some(locked_until),
        }
    }

    /// Report the lockout state of `identifier` without counting an attempt.
    pub fn status(&self, identifier: &str, now: DateTime<Utc>) -> LockoutStatus {
        let records = self.records.lock();
        let threshold = self.config.threshold;

        match records.get(&identifier.to_string()) {
            Some(record) if record.is_locked_at(now) => LockoutStatus {
                is_locked: true,
                remaining_attempts: threshold.saturating_sub(record.attempt_count),
                lockout_ends_at: record.locked_until,
            },
            Some(record) if !record.lockout_elapsed_at(now) => LockoutStatus {
                is_locked: false,
                remaining_attempts: threshold.saturating_sub(record.attempt_count),
                lockout_ends_at: None,
            },
            _ => LockoutStatus {
                is_locked: false,
                remaining_attempts: threshold,
                lockout_ends_at: None,
            },
        }
    }

    /// Forget `identifier`, e.g. after a successful login.
    pub fn reset(&self, identifier: &str) {
        if self.records.lock().remove(&identifier.to_string()).is_some() {
            trace!(identifier = %identifier, "Lockout record reset");
        }
    }

    /// Record an attempt at the current wall-clock time.
    pub fn record_attempt_now(&self, identifier: &str) -> AttemptDecision {
        self.record_attempt(identifier, Utc::now())
    }

    /// Status at the current wall-clock time.
    pub fn status_now(&self, identifier: &str) -> LockoutStatus {
        self.status(identifier, Utc::now())
    }

    /// Number of identifiers currently tracked.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether no identifiers are tracked.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Maximum number of identifiers tracked at once.
    pub fn capacity(&self) -> usize {
        self.records.lock().capacity()
    }
}
