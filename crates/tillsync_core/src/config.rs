//! Local persistence configuration.

use std::time::Duration;

/// Configuration for opening an [`crate::OfflineDb`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Whether to create the data directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to fsync every append before returning (safer but slower).
    pub sync_on_write: bool,

    /// Logs smaller than this are never compacted automatically.
    pub compaction_min_bytes: u64,

    /// A log is rewritten once its size exceeds this multiple of its
    /// live contents.
    pub compaction_ratio: u32,

    /// How long `Done` queue entries are kept before garbage collection.
    pub retention: Duration,

    /// Retry schedule and attempt cap for transient failures.
    pub retry: RetryPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_write: true,
            compaction_min_bytes: 256 * 1024, // 256 KB
            compaction_ratio: 4,
            retention: Duration::from_secs(24 * 60 * 60),
            retry: RetryPolicy::default(),
        }
    }
}

impl StoreConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the data directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to fsync every append.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Sets the size below which logs are never compacted.
    #[must_use]
    pub const fn compaction_min_bytes(mut self, bytes: u64) -> Self {
        self.compaction_min_bytes = bytes;
        self
    }

    /// Sets the garbage-to-live ratio that triggers compaction.
    #[must_use]
    pub const fn compaction_ratio(mut self, ratio: u32) -> Self {
        self.compaction_ratio = ratio;
        self
    }

    /// Sets the retention window for `Done` entries.
    #[must_use]
    pub const fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns true when a log of `size` bytes holding `live` bytes of
    /// current data should be rewritten.
    #[must_use]
    pub fn should_compact(&self, size: u64, live: u64) -> bool {
        size >= self.compaction_min_bytes
            && size > live.saturating_mul(u64::from(self.compaction_ratio.max(1)))
    }
}

/// Exponential backoff for transiently failed queue entries.
///
/// The delay before attempt `n + 1` is `min(base_delay * 2^n, max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Attempts allowed before an entry becomes `Failed`.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10 * 60),
            max_attempts: 8,
        }
    }
}

impl RetryPolicy {
    /// A policy that never delays retries.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_attempts,
        }
    }

    /// Sets the base delay.
    #[must_use]
    pub const fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the attempt cap.
    #[must_use]
    pub const fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Delay to wait after an entry has failed `attempts` times.
    #[must_use]
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = StoreConfig::default();
        assert!(config.create_if_missing);
        assert!(config.sync_on_write);
        assert_eq!(config.retention, Duration::from_secs(86_400));
        assert_eq!(config.retry.max_attempts, 8);
    }

    #[test]
    fn builder_pattern() {
        let config = StoreConfig::new()
            .create_if_missing(false)
            .sync_on_write(false)
            .retry(RetryPolicy::immediate(3));

        assert!(!config.create_if_missing);
        assert!(!config.sync_on_write);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn compaction_trigger() {
        let config = StoreConfig::new()
            .compaction_min_bytes(100)
            .compaction_ratio(2);
        assert!(!config.should_compact(99, 0));
        assert!(!config.should_compact(200, 100));
        assert!(config.should_compact(201, 100));
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = RetryPolicy::default()
            .base_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(30));

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(16));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(30));
    }

    #[test]
    fn immediate_policy_has_no_delay() {
        assert_eq!(RetryPolicy::immediate(5).delay_for_attempt(3), Duration::ZERO);
    }
}
