//! Turnstile - Admission Control Primitives
//!
//! This crate protects a backend service from overload with three
//! independent components that a request pipeline composes:
//!
//! - [`ratelimit::DistributedWindowLimiter`] caps events per caller per
//!   fixed window, with counters kept in a store shared by every instance.
//! - [`lockout::LocalLockoutTracker`] locks out identifiers that make too
//!   many failed attempts, using bounded in-process memory.
//! - [`concurrency::ConcurrencySemaphore`] bounds how many expensive
//!   operations run at once, admitting queued callers in arrival order.
//!
//! Each returns a plain decision; mapping it to a transport response is
//! left to the caller.

pub mod concurrency;
pub mod config;
pub mod error;
pub mod lockout;
pub mod ratelimit;

pub use concurrency::{ConcurrencySemaphore, SemaphorePermit};
pub use config::TurnstileConfig;
pub use error::{Result, TurnstileError};
pub use lockout::LocalLockoutTracker;
pub use ratelimit::{CounterStore, DistributedWindowLimiter, MemoryCounterStore};
