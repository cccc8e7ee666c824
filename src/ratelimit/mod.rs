//! Cross-instance window rate limiting.

mod key;
mod memory;
mod store;
mod window;

pub use key::{is_valid_scope, window_start, RateWindowKey};
pub use memory::MemoryCounterStore;
pub use store::{CounterStore, StoreError};
pub use window::{DistributedWindowLimiter, WindowDecision};
