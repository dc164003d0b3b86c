//! Core types for partition migration.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a member of the cluster.
pub type NodeId = u64;

/// Partition identifier in `[0, partition_count)`.
pub type PartitionId = u32;

/// Replica slot of a partition: 0 is the owner, `1..=backup_count` are backups.
pub type ReplicaIndex = u32;

/// Kind of change a migration applies to a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationType {
    /// Ownership (or a backup slot) moves from source to destination.
    Move,
    /// A new backup is created on the destination.
    Copy,
    /// A backup is removed from the source.
    Shrink,
}

impl fmt::Display for MigrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationType::Move => write!(f, "move"),
            MigrationType::Copy => write!(f, "copy"),
            MigrationType::Shrink => write!(f, "shrink"),
        }
    }
}

/// The unit of migration work handed to every participant.
///
/// Events are immutable once built; the coordinator and the destination both
/// see the same value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationServiceEvent {
    pub partition_id: PartitionId,
    pub replica_index: ReplicaIndex,
    /// Member currently holding the replica, absent when the previous holder is gone.
    pub source: Option<NodeId>,
    pub destination: NodeId,
    pub migration_type: MigrationType,
}

impl MigrationServiceEvent {
    /// Create a new event.
    pub fn new(
        partition_id: PartitionId,
        replica_index: ReplicaIndex,
        source: Option<NodeId>,
        destination: NodeId,
        migration_type: MigrationType,
    ) -> Self {
        Self {
            partition_id,
            replica_index,
            source,
            destination,
            migration_type,
        }
    }

    /// Ownership move of `partition_id` from `source` to `destination`.
    pub fn move_owner(partition_id: PartitionId, source: NodeId, destination: NodeId) -> Self {
        Self::new(partition_id, 0, Some(source), destination, MigrationType::Move)
    }

    /// New backup at `replica_index`, copied from `source`.
    pub fn copy_backup(
        partition_id: PartitionId,
        replica_index: ReplicaIndex,
        source: NodeId,
        destination: NodeId,
    ) -> Self {
        Self::new(
            partition_id,
            replica_index,
            Some(source),
            destination,
            MigrationType::Copy,
        )
    }

    /// Removal of the backup at `replica_index` held by `source`.
    ///
    /// The owner drives the migration, so `destination` is the owner.
    pub fn shrink_backup(
        partition_id: PartitionId,
        replica_index: ReplicaIndex,
        source: NodeId,
        destination: NodeId,
    ) -> Self {
        Self::new(
            partition_id,
            replica_index,
            Some(source),
            destination,
            MigrationType::Shrink,
        )
    }

    /// Whether this event moves partition ownership.
    pub fn is_ownership_change(&self) -> bool {
        self.migration_type == MigrationType::Move && self.replica_index == 0
    }

    /// Whether the source should drop its copy once the migration commits.
    pub fn releases_source(&self) -> bool {
        matches!(
            self.migration_type,
            MigrationType::Move | MigrationType::Shrink
        )
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

impl fmt::Display for MigrationServiceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source {
            Some(source) => write!(
                f,
                "{} partition {} replica {} ({} -> {})",
                self.migration_type, self.partition_id, self.replica_index, source, self.destination
            ),
            None => write!(
                f,
                "{} partition {} replica {} (-> {})",
                self.migration_type, self.partition_id, self.replica_index, self.destination
            ),
        }
    }
}
