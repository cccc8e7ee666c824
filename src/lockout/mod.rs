//! Single-instance lockout of repeated failed attempts.

mod store;
mod tracker;

pub use store::BoundedRecordStore;
pub use tracker::{AttemptDecision, LocalLockoutTracker, LockoutRecord, LockoutStatus};
