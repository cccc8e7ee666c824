//! Error types for Turnstile.

use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::StoreError;

/// Main error type for Turnstile operations.
///
/// A quota denial is never an error: it is reported as `allowed = false`
/// in the decision returned by each component.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The backing counter store failed (distinct from a quota denial)
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// No concurrency slot became free before the deadline
    #[error("Timed out after {waited:?} waiting for a concurrency slot")]
    AcquireTimeout {
        /// How long the caller waited
        waited: Duration,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// Whether this error means the semaphore timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TurnstileError::AcquireTimeout { .. })
    }

    /// Whether this error came from the counter store.
    pub fn is_store(&self) -> bool {
        matches!(self, TurnstileError::Store(_))
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
