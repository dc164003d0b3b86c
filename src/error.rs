//! Error types for partition migration.

use crate::types::{NodeId, PartitionId};
use thiserror::Error;

/// Result type alias for grid migration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the migration core.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Partition id is outside `[0, partition_count)`.
    #[error("partition {partition_id} out of range (partition count {partition_count})")]
    PartitionOutOfRange {
        partition_id: PartitionId,
        partition_count: u32,
    },

    /// The migration event cannot be applied to the current table entry.
    #[error("invalid migration for partition {partition_id}: {reason}")]
    InvalidMigration {
        partition_id: PartitionId,
        reason: String,
    },

    /// A non-terminal migration already exists for the partition.
    #[error("partition {0} is already migrating")]
    PartitionMigrating(PartitionId),

    /// No active migration for the partition.
    #[error("no active migration for partition {0}")]
    MigrationNotFound(PartitionId),

    /// Migration is past the point of no return and cannot be cancelled.
    #[error("migration for partition {0} is committing")]
    MigrationCommitting(PartitionId),

    /// The coordinator is paused.
    #[error("migrations are paused")]
    MigrationPaused,

    /// A participant with the same service name was already registered.
    #[error("participant already registered: {0}")]
    DuplicateParticipant(String),

    /// A participant callback failed.
    #[error("participant {service} failed: {reason}")]
    Participant { service: String, reason: String },

    /// Destination did not acknowledge within the configured attempts.
    #[error("transfer to node {destination} timed out after {attempts} attempts")]
    TransferTimeout { destination: NodeId, attempts: u32 },

    /// Destination explicitly refused the migration operation.
    #[error("transfer rejected by node {destination}: {reason}")]
    TransferRejected { destination: NodeId, reason: String },

    /// Hard transport failure (connection refused, peer gone, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// Source-side commit failed after the destination acknowledged.
    #[error("commit failed for {service} on partition {partition_id}: {reason}")]
    CommitFailure {
        service: String,
        partition_id: PartitionId,
        reason: String,
    },

    /// A partition task panicked or its worker went away.
    #[error("partition task aborted on partition {0}")]
    TaskAborted(PartitionId),

    /// The partition executor has been shut down.
    #[error("partition executor is shut down")]
    ExecutorShutdown,

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Serialization errors.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a participant failure.
    pub fn participant(service: impl Into<String>, reason: impl ToString) -> Self {
        Error::Participant {
            service: service.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransferTimeout { .. })
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
