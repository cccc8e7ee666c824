//! Configuration management for Turnstile.
//!
//! Settings come from an optional YAML file overlaid with `TURNSTILE_*`
//! environment variables, e.g. `TURNSTILE_CONCURRENCY__MAX_CONCURRENT=8`.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};

/// Prefix for environment overrides.
const ENV_PREFIX: &str = "TURNSTILE";

/// Upper bound for window sizes and expiry margins (366 days).
pub const MAX_WINDOW_SECS: u64 = 366 * 24 * 60 * 60;

/// Main configuration for the admission-control components.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Distributed window limiter configuration
    #[serde(default)]
    pub rate_limit: WindowLimiterConfig,

    /// Failed-attempt lockout configuration
    #[serde(default)]
    pub lockout: LockoutConfig,

    /// Concurrency gate configuration
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
}

/// Window limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLimiterConfig {
    /// Window size in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Events allowed per identifier per window
    #[serde(default = "default_window_threshold")]
    pub threshold: u64,

    /// Extra seconds a window key lives past the end of its window
    #[serde(default = "default_expiry_margin")]
    pub expiry_margin_secs: u64,
}

impl Default for WindowLimiterConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            threshold: default_window_threshold(),
            expiry_margin_secs: default_expiry_margin(),
        }
    }
}

fn default_window_secs() -> u64 {
    60
}

fn default_window_threshold() -> u64 {
    100
}

fn default_expiry_margin() -> u64 {
    60
}

/// Lockout tracker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockoutConfig {
    /// Attempts allowed before the identifier is locked out
    #[serde(default = "default_lockout_threshold")]
    pub threshold: u32,

    /// How long a lockout lasts, in seconds
    #[serde(default = "default_lockout_secs")]
    pub lockout_secs: u64,

    /// Maximum number of identifiers tracked at once
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            threshold: default_lockout_threshold(),
            lockout_secs: default_lockout_secs(),
            max_entries: default_max_entries(),
        }
    }
}

impl LockoutConfig {
    /// Lockout duration as a `chrono` duration.
    pub fn lockout_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lockout_secs as i64)
    }
}

fn default_lockout_threshold() -> u32 {
    5
}

fn default_lockout_secs() -> u64 {
    900
}

fn default_max_entries() -> usize {
    10_000
}

/// Concurrency semaphore configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Maximum number of guarded operations running at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Default acquisition timeout in milliseconds (unset waits forever)
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            acquire_timeout_ms: None,
        }
    }
}

impl ConcurrencyConfig {
    /// Default acquisition timeout, if configured.
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }
}

fn default_max_concurrent() -> usize {
    5
}

impl TurnstileConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig =
            serde_yaml::from_str(yaml).map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load defaults overlaid with `TURNSTILE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load an optional YAML file, then apply environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Same as [`load`](Self::load), with the environment supplied explicitly.
    fn load_with_env(path: Option<&str>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::with_name(path).format(config::FileFormat::Yaml),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let config: TurnstileConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make a component unusable.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.window_secs == 0 {
            return Err(TurnstileError::Config(
                "rate_limit.window_secs must be greater than zero".to_string(),
            ));
        }
        if self.rate_limit.window_secs > MAX_WINDOW_SECS {
            return Err(TurnstileError::Config(format!(
                "rate_limit.window_secs must be at most {}",
                MAX_WINDOW_SECS
            )));
        }
        if self.rate_limit.expiry_margin_secs > MAX_WINDOW_SECS {
            return Err(TurnstileError::Config(format!(
                "rate_limit.expiry_margin_secs must be at most {}",
                MAX_WINDOW_SECS
            )));
        }
        if self.lockout.threshold == 0 {
            return Err(TurnstileError::Config(
                "lockout.threshold must be greater than zero".to_string(),
            ));
        }
        if self.lockout.max_entries == 0 {
            return Err(TurnstileError::Config(
                "lockout.max_entries must be greater than zero".to_string(),
            ));
        }
        if self.concurrency.max_concurrent == 0 {
            return Err(TurnstileError::Config(
                "concurrency.max_concurrent must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
