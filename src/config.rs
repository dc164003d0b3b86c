//! Configuration types for a grid node.
//!
//! Configuration is built programmatically by the embedding application and
//! handed to [`NodeBuilder`](crate::NodeBuilder). Nothing here reads files or
//! environment variables.

use crate::error::{Error, Result};
use crate::types::NodeId;
use std::time::Duration;

/// Main configuration for a grid node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Instance name, used to name worker threads and in logs.
    pub instance_name: String,

    /// Number of partitions. Fixed for the lifetime of the cluster.
    pub partition_count: u32,

    /// Number of backups kept for every partition.
    pub backup_count: u32,

    /// Partition executor configuration.
    pub executor: ExecutorConfig,

    /// Migration coordinator configuration.
    pub migration: MigrationConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            instance_name: "grid".to_string(),
            partition_count: 271,
            backup_count: 1,
            executor: ExecutorConfig::default(),
            migration: MigrationConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Create a new configuration with the given node ID.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    /// Set the instance name.
    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = name.into();
        self
    }

    /// Set the partition count.
    pub fn with_partition_count(mut self, count: u32) -> Self {
        self.partition_count = count;
        self
    }

    /// Set the backup count.
    pub fn with_backup_count(mut self, count: u32) -> Self {
        self.backup_count = count;
        self
    }

    /// Set the executor configuration.
    pub fn with_executor_config(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    /// Set the number of partition worker threads.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.executor.pool_size = pool_size;
        self
    }

    /// Set the migration configuration.
    pub fn with_migration_config(mut self, migration: MigrationConfig) -> Self {
        self.migration = migration;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.partition_count == 0 {
            return Err(Error::Config("partition_count must be positive".into()));
        }
        if self.instance_name.is_empty() {
            return Err(Error::Config("instance_name must not be empty".into()));
        }
        self.executor.validate()?;
        self.migration.validate()
    }
}

/// Partition executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of worker threads. Partitions are striped by `partition_id % pool_size`.
    pub pool_size: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            pool_size: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

impl ExecutorConfig {
    /// Create a config with an explicit pool size.
    pub fn new(pool_size: usize) -> Self {
        Self { pool_size }
    }

    fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::Config("executor pool_size must be positive".into()));
        }
        Ok(())
    }
}

/// Configuration for the migration coordinator.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// How long to wait for the destination to acknowledge one attempt.
    pub ack_timeout: Duration,

    /// Transfer attempts before a timing-out migration is rolled back.
    pub max_transfer_attempts: u32,

    /// Backoff before the second attempt.
    pub initial_backoff: Duration,

    /// Upper bound for the backoff between attempts.
    pub max_backoff: Duration,

    /// Relative jitter applied to every backoff (0.0 - 1.0).
    pub backoff_jitter: f64,

    /// Maximum migrations in flight on this node.
    pub max_concurrent_migrations: usize,

    /// Maximum migrations in flight towards a single destination.
    pub max_in_flight_per_destination: usize,

    /// Extra attempts for a source-side commit that failed.
    pub commit_retry_attempts: u32,

    /// Number of finished migrations kept in history.
    pub history_limit: usize,

    /// Number of migration ids remembered by the receiver for duplicate detection.
    pub dedupe_capacity: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(5),
            max_transfer_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            backoff_jitter: 0.2,
            max_concurrent_migrations: 8,
            max_in_flight_per_destination: 2,
            commit_retry_attempts: 2,
            history_limit: 100,
            dedupe_capacity: 1024,
        }
    }
}

impl MigrationConfig {
    /// Set the acknowledgment timeout.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set the number of transfer attempts.
    pub fn with_max_transfer_attempts(mut self, attempts: u32) -> Self {
        self.max_transfer_attempts = attempts;
        self
    }

    /// Set the backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Set the global in-flight cap.
    pub fn with_max_concurrent_migrations(mut self, max: usize) -> Self {
        self.max_concurrent_migrations = max;
        self
    }

    /// Set the per-destination in-flight cap.
    pub fn with_max_in_flight_per_destination(mut self, max: usize) -> Self {
        self.max_in_flight_per_destination = max;
        self
    }

    /// Set the commit retry attempts.
    pub fn with_commit_retry_attempts(mut self, attempts: u32) -> Self {
        self.commit_retry_attempts = attempts;
        self
    }

    /// Backoff before attempt `attempt + 1`, without jitter.
    ///
    /// `attempt` is 1-based: the delay after the first failed attempt is
    /// `initial_backoff`, doubling afterwards up to `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }

    fn validate(&self) -> Result<()> {
        if self.max_transfer_attempts == 0 {
            return Err(Error::Config("max_transfer_attempts must be positive".into()));
        }
        if self.max_concurrent_migrations == 0 || self.max_in_flight_per_destination == 0 {
            return Err(Error::Config("migration in-flight caps must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(Error::Config("backoff_jitter must be within 0.0..=1.0".into()));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(Error::Config("initial_backoff exceeds max_backoff".into()));
        }
        Ok(())
    }
}
