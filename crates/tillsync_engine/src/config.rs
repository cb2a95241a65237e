//! Configuration for the sync engine.

use std::time::Duration;
use tillsync_core::{RetryPolicy, StoreConfig};

/// Configuration for an [`crate::Engine`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Local persistence settings, including the retry policy.
    pub store: StoreConfig,
    /// Period of the background drain while online.
    pub interval: Duration,
    /// Upper bound on a single remote call.
    pub request_timeout: Duration,
    /// Run garbage collection every this many drains (0 = never).
    pub gc_every: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(15),
            gc_every: 20,
        }
    }
}

impl SyncConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the local persistence settings.
    #[must_use]
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.store = self.store.retry(retry);
        self
    }

    /// Sets the periodic drain interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets how often garbage collection runs.
    #[must_use]
    pub fn with_gc_every(mut self, drains: u32) -> Self {
        self.gc_every = drains;
        self
    }

    /// The retry policy in effect.
    #[must_use]
    pub fn retry(&self) -> RetryPolicy {
        self.store.retry
    }
}
