//! Store keys for fixed-window counters.

use std::fmt;

/// Separator between the parts of a rendered key.
const SEPARATOR: char = '#';

/// Key identifying one caller's counter for one window.
///
/// Rendered as `{scope}#{identifier}#{window_start}`. Two events in the same
/// window for the same identifier map to the same key; adjacent windows map
/// to different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateWindowKey {
    /// The limiter scope (e.g. `login`, `api`).
    pub scope: String,
    /// The caller identifier (usually an IP address).
    pub identifier: String,
    /// Window start in epoch seconds, floored to the window boundary.
    pub window_start: i64,
}

impl RateWindowKey {
    /// Create a new window key.
    pub fn new(scope: &str, identifier: &str, window_start: i64) -> Self {
        Self {
            scope: scope.to_string(),
            identifier: identifier.to_string(),
            window_start,
        }
    }

    /// Build the key for the window containing `now_secs`.
    pub fn for_instant(scope: &str, identifier: &str, now_secs: i64, window_secs: u64) -> Self {
        Self::new(scope, identifier, window_start(now_secs, window_secs))
    }

    /// Convert to the string used as the store key.
    pub fn to_store_key(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            self.scope,
            self.identifier,
            self.window_start,
            sep = SEPARATOR
        )
    }

    /// Parse from a store key string.
    ///
    /// The scope ends at the first separator and the window at the last, so
    /// identifiers may themselves contain the separator.
    pub fn from_store_key(key: &str) -> Option<Self> {
        let (rest, window) = key.rsplit_once(SEPARATOR)?;
        let window_start: i64 = window.parse().ok()?;
        let (scope, identifier) = rest.split_once(SEPARATOR)?;
        if scope.is_empty() || identifier.is_empty() {
            return None;
        }

        Some(Self::new(scope, identifier, window_start))
    }
}

impl fmt::Display for RateWindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_store_key())
    }
}

/// Whether `scope` can be rendered into a key without colliding with
/// another scope/identifier pair.
pub fn is_valid_scope(scope: &str) -> bool {
    !scope.is_empty() && !scope.contains(SEPARATOR)
}

/// Floor `now_secs` to the start of its window.
pub fn window_start(now_secs: i64, window_secs: u64) -> i64 {
    let window = window_secs.clamp(1, i64::MAX as u64) as i64;
    now_secs.div_euclid(window) * window
}
