//! Sync engine configuration.

use crate::ids::ClientId;
use crate::retry::RetryConfig;
use std::time::Duration;

/// Configuration for sync behavior.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Identifies this client as the origin of remote writes
    pub client_id: ClientId,
    /// Period of background sync cycles
    pub sync_interval: Duration,
    /// Quiet period before a snapshot save is written
    pub debounce: Duration,
    /// Hard timeout for every remote call
    pub request_timeout: Duration,
    /// Operations drained per cycle
    pub batch_size: usize,
    /// Queued operations older than this are dropped instead of retried
    pub stale_after: Duration,
    /// Resubmissions with a fresh id after a uniqueness violation
    pub max_id_regenerations: u32,
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            client_id: ClientId::generate(),
            sync_interval: Duration::from_secs(30),
            debounce: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
            batch_size: 50,
            stale_after: Duration::from_secs(5 * 60),
            max_id_regenerations: 3,
            retry: RetryConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }
}

/// Builder for sync configuration.
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn client_id(mut self, id: ClientId) -> Self {
        self.config.client_id = id;
        self
    }

    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.config.sync_interval = interval;
        self
    }

    pub fn debounce(mut self, window: Duration) -> Self {
        self.config.debounce = window;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size.max(1);
        self
    }

    pub fn stale_after(mut self, age: Duration) -> Self {
        self.config.stale_after = age;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.retry.max_retries = retries.max(1);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn max_id_regenerations(mut self, attempts: u32) -> Self {
        self.config.max_id_regenerations = attempts;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
