//! Log throttling utility
//!
//! Limits how often the same log message is recorded. Per-frame failures in
//! the capture and encode paths would otherwise flood the log at the render
//! rate.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Log throttler that limits how often the same message is logged
///
/// Keys are free-form strings naming the failure, such as `"copy"` or
/// `"encode"`. A capturer or encode worker owns one throttler and logs
/// through [`warn_throttled!`](crate::warn_throttled).
///
/// # Example
///
/// ```rust
/// use pixelcast::utils::LogThrottler;
///
/// let throttler = LogThrottler::with_secs(5);
///
/// // The first failure is logged
/// assert!(throttler.should_log("copy_failed"));
///
/// // Repeats within 5 seconds are not
/// assert!(!throttler.should_log("copy_failed"));
///
/// // Recovery resets the key
/// throttler.clear("copy_failed");
/// assert!(throttler.should_log("copy_failed"));
/// ```
pub struct LogThrottler {
    /// Last time each key was logged
    last_logged: RwLock<HashMap<String, Instant>>,
    /// Minimum time between two logs of one key
    interval: Duration,
}

impl LogThrottler {
    /// Create a throttler
    ///
    /// # Arguments
    ///
    /// * `interval` - Minimum time between log messages for the same key
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: RwLock::new(HashMap::new()),
            interval,
        }
    }

    /// Create a throttler with the interval given in seconds
    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Check whether a message should be logged now
    ///
    /// Returns `true` when `key` has not been logged within the interval.
    /// A `true` result records the current time for `key`.
    ///
    /// # Arguments
    ///
    /// * `key` - Identifier of the message kind
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();

        // Read lock first; most calls are throttled
        {
            let map = self.last_logged.read();
            if let Some(last) = map.get(key) {
                if now.duration_since(*last) < self.interval {
                    return false;
                }
            }
        }

        let mut map = self.last_logged.write();
        // Another thread may have logged between the two locks
        if let Some(last) = map.get(key) {
            if now.duration_since(*last) < self.interval {
                return false;
            }
        }
        map.insert(key.to_string(), now);
        true
    }

    /// Forget `key` so the next occurrence is logged immediately
    ///
    /// Call this when the failing condition recovers.
    ///
    /// # Arguments
    ///
    /// * `key` - The key to clear
    pub fn clear(&self, key: &str) {
        self.last_logged.write().remove(key);
    }

    /// Number of keys currently tracked
    pub fn len(&self) -> usize {
        self.last_logged.read().len()
    }

    /// `true` when no key has been logged yet
    pub fn is_empty(&self) -> bool {
        self.last_logged.read().is_empty()
    }
}

impl Default for LogThrottler {
    /// Throttler with a 5 second interval
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `warn!`
///
/// # Arguments
///
/// * `$throttler` - A [`LogThrottler`](crate::utils::LogThrottler)
/// * `$key` - Message kind passed to `should_log`
/// * the rest - `tracing::warn!` format arguments
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::warn!($($arg)*);
        }
    };
}
