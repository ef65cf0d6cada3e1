//! Sync controller configuration.

use crate::error::{SyncError, SyncResult};
use crate::queue::RateLimit;
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for one sync controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncControllerConfig {
    /// Number of reconcile workers.
    pub workers: usize,

    /// Restrict the federation watch to one namespace (`None` = all).
    pub namespace: Option<String>,

    /// Add a finalizer so member-cluster cleanup completes before the
    /// federated object disappears.
    pub use_finalizers: bool,

    /// Delay before re-reconciling an object with unreachable clusters.
    pub reschedule_delay_ms: u64,

    /// Delay before re-reconciling every object after a cluster becomes ready.
    pub cluster_available_delay_ms: u64,

    /// Delay before re-reconciling every object after a cluster becomes unready.
    pub cluster_unavailable_delay_ms: u64,

    /// Initial backoff before relisting after a dropped watch.
    pub watch_backoff_initial_ms: u64,

    /// Maximum backoff before relisting after a dropped watch.
    pub watch_backoff_max_ms: u64,

    /// Attempts per member-cluster mutation for transient errors.
    pub retry_attempts: u32,

    /// Initial retry delay for member-cluster mutations.
    pub retry_initial_ms: u64,

    /// Maximum retry delay for member-cluster mutations.
    pub retry_max_ms: u64,

    /// Immediate re-fetch-and-retry rounds on conflicts.
    pub conflict_retries: u32,

    /// Per-key queue backoff after a failed reconcile.
    pub queue_base_delay_ms: u64,

    /// Upper bound of the per-key queue backoff.
    pub queue_max_delay_ms: u64,

    /// Shrink every delay. Used by tests and fixtures.
    pub minimize_latency: bool,
}

impl Default for SyncControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            namespace: None,
            use_finalizers: true,
            reschedule_delay_ms: 10_000,
            cluster_available_delay_ms: 20_000,
            cluster_unavailable_delay_ms: 60_000,
            watch_backoff_initial_ms: 1_000,
            watch_backoff_max_ms: 30_000,
            retry_attempts: 3,
            retry_initial_ms: 100,
            retry_max_ms: 5_000,
            conflict_retries: 3,
            queue_base_delay_ms: 5,
            queue_max_delay_ms: 300_000,
            minimize_latency: false,
        }
    }
}

impl SyncControllerConfig {
    /// Create a new configuration builder.
    pub fn builder() -> SyncControllerConfigBuilder {
        SyncControllerConfigBuilder::default()
    }

    /// Switch to minimal-latency delays.
    pub fn minimize_latency(mut self) -> Self {
        self.minimize_latency = true;
        self.reschedule_delay_ms = 100;
        self.cluster_available_delay_ms = 10;
        self.cluster_unavailable_delay_ms = 10;
        self.watch_backoff_initial_ms = 10;
        self.watch_backoff_max_ms = 100;
        self.retry_initial_ms = 5;
        self.retry_max_ms = 50;
        self.queue_base_delay_ms = 1;
        self.queue_max_delay_ms = 1_000;
        self
    }

    /// Get the reschedule delay as a Duration.
    pub fn reschedule_delay(&self) -> Duration {
        Duration::from_millis(self.reschedule_delay_ms)
    }

    /// Get the cluster-available delay as a Duration.
    pub fn cluster_available_delay(&self) -> Duration {
        Duration::from_millis(self.cluster_available_delay_ms)
    }

    /// Get the cluster-unavailable delay as a Duration.
    pub fn cluster_unavailable_delay(&self) -> Duration {
        Duration::from_millis(self.cluster_unavailable_delay_ms)
    }

    /// Backoff for relisting after a dropped watch.
    pub fn watch_backoff(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(self.watch_backoff_initial_ms),
            max_delay: Duration::from_millis(self.watch_backoff_max_ms),
            backoff_multiplier: 2.0,
        }
    }

    /// Retry policy for member-cluster mutations.
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_attempts,
            initial_delay: Duration::from_millis(self.retry_initial_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
            backoff_multiplier: 2.0,
        }
    }

    /// Per-key backoff of the work queue.
    pub fn rate_limit(&self) -> RateLimit {
        RateLimit {
            base_delay: Duration::from_millis(self.queue_base_delay_ms),
            max_delay: Duration::from_millis(self.queue_max_delay_ms),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.workers == 0 {
            return Err(SyncError::Config("workers must be > 0".into()));
        }

        if self.retry_attempts == 0 {
            return Err(SyncError::Config("retry_attempts must be > 0".into()));
        }

        if self.watch_backoff_initial_ms == 0 || self.watch_backoff_initial_ms > self.watch_backoff_max_ms {
            return Err(SyncError::Config(format!(
                "watch_backoff_initial_ms ({}) must be > 0 and <= watch_backoff_max_ms ({})",
                self.watch_backoff_initial_ms, self.watch_backoff_max_ms
            )));
        }

        if self.retry_initial_ms > self.retry_max_ms {
            return Err(SyncError::Config(format!(
                "retry_initial_ms ({}) must be <= retry_max_ms ({})",
                self.retry_initial_ms, self.retry_max_ms
            )));
        }

        if self.queue_base_delay_ms > self.queue_max_delay_ms {
            return Err(SyncError::Config(format!(
                "queue_base_delay_ms ({}) must be <= queue_max_delay_ms ({})",
                self.queue_base_delay_ms, self.queue_max_delay_ms
            )));
        }

        if self.namespace.as_deref() == Some("") {
            return Err(SyncError::Config("namespace must not be empty".into()));
        }

        Ok(())
    }
}

/// Builder for SyncControllerConfig.
#[derive(Debug, Default)]
pub struct SyncControllerConfigBuilder {
    config: SyncControllerConfig,
}

impl SyncControllerConfigBuilder {
    /// Set the number of workers.
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Restrict the federation watch to a namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = Some(namespace.into());
        self
    }

    /// Enable or disable the sync finalizer.
    pub fn use_finalizers(mut self, enabled: bool) -> Self {
        self.config.use_finalizers = enabled;
        self
    }

    /// Set the reschedule delay in milliseconds.
    pub fn reschedule_delay_ms(mut self, ms: u64) -> Self {
        self.config.reschedule_delay_ms = ms;
        self
    }

    /// Set the cluster availability delays in milliseconds.
    pub fn cluster_delays_ms(mut self, available: u64, unavailable: u64) -> Self {
        self.config.cluster_available_delay_ms = available;
        self.config.cluster_unavailable_delay_ms = unavailable;
        self
    }

    /// Set the mutation retry policy.
    pub fn retry(mut self, attempts: u32, initial_ms: u64, max_ms: u64) -> Self {
        self.config.retry_attempts = attempts;
        self.config.retry_initial_ms = initial_ms;
        self.config.retry_max_ms = max_ms;
        self
    }

    /// Set the number of conflict re-fetch rounds.
    pub fn conflict_retries(mut self, rounds: u32) -> Self {
        self.config.conflict_retries = rounds;
        self
    }

    /// Switch to minimal-latency delays.
    pub fn minimize_latency(mut self, enabled: bool) -> Self {
        if enabled {
            self.config = self.config.minimize_latency();
        }
        self
    }

    /// Build the configuration.
    pub fn build(self) -> SyncResult<SyncControllerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
