//! Bounding concurrent expensive operations within one process.

mod semaphore;

pub use semaphore::{ConcurrencySemaphore, SemaphorePermit};
