//! Authoritative partition table.
//!
//! Maps every partition to its owner and ordered backups. Readers always get
//! cloned, internally consistent entries; writers go through a single lock so
//! that migrations on different partitions are linearized.

use crate::error::{Error, Result};
use crate::types::{MigrationServiceEvent, MigrationType, NodeId, PartitionId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use twox_hash::XxHash64;

/// Seed for key routing. Every member must use the same value.
const ROUTING_SEED: u64 = 0;

/// Ownership of a single partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTableEntry {
    pub partition_id: PartitionId,
    /// Owner (replica index 0). `None` until the initial assignment.
    pub owner: Option<NodeId>,
    /// Backups in replica order: `replicas[i]` holds replica index `i + 1`.
    pub replicas: Vec<NodeId>,
    /// Set while a migration for this partition is in flight.
    pub migrating: bool,
    /// Bumped on every committed ownership change.
    pub version: u64,
}

impl PartitionTableEntry {
    /// Create an unassigned entry.
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            owner: None,
            replicas: Vec::new(),
            migrating: false,
            version: 0,
        }
    }

    /// Member at `replica_index`, if any.
    pub fn replica(&self, replica_index: u32) -> Option<NodeId> {
        if replica_index == 0 {
            self.owner
        } else {
            self.replicas.get(replica_index as usize - 1).copied()
        }
    }

    /// Whether `node` holds any replica of this partition.
    pub fn contains(&self, node: NodeId) -> bool {
        self.owner == Some(node) || self.replicas.contains(&node)
    }

    /// Owner and backups this entry would have after `event` commits.
    pub fn migrated(
        &self,
        event: &MigrationServiceEvent,
        max_backups: u32,
    ) -> Result<(NodeId, Vec<NodeId>)> {
        let invalid = |reason: String| Error::InvalidMigration {
            partition_id: self.partition_id,
            reason,
        };
        if event.partition_id != self.partition_id {
            return Err(invalid(format!(
                "event targets partition {}",
                event.partition_id
            )));
        }
        if event.source == Some(event.destination) {
            return Err(invalid("source and destination are the same node".into()));
        }

        let index = event.replica_index;
        let mut replicas = self.replicas.clone();
        let owner = match (event.migration_type, index) {
            (MigrationType::Move, 0) => {
                if event.source.is_some() && event.source != self.owner {
                    return Err(invalid(format!(
                        "source {:?} is not the owner {:?}",
                        event.source, self.owner
                    )));
                }
                if event.source.is_none() && self.owner.is_some() {
                    return Err(invalid("move without source on an owned partition".into()));
                }
                replicas.retain(|&n| n != event.destination);
                event.destination
            }
            (MigrationType::Copy | MigrationType::Shrink, 0) => {
                return Err(invalid(format!(
                    "{} is not allowed on the owner slot",
                    event.migration_type
                )));
            }
            (migration_type, _) => {
                let owner = self
                    .owner
                    .ok_or_else(|| invalid("partition has no owner".into()))?;
                let slot = index as usize - 1;
                match migration_type {
                    MigrationType::Move => {
                        let current = *replicas
                            .get(slot)
                            .ok_or_else(|| invalid(format!("no backup at replica {}", index)))?;
                        if event.source.is_some_and(|s| s != current) {
                            return Err(invalid(format!(
                                "source {:?} does not hold replica {}",
                                event.source, index
                            )));
                        }
                        replicas[slot] = event.destination;
                    }
                    MigrationType::Copy => {
                        if self.contains(event.destination) {
                            return Err(invalid(format!(
                                "node {} already holds a replica",
                                event.destination
                            )));
                        }
                        replicas.insert(slot.min(replicas.len()), event.destination);
                    }
                    MigrationType::Shrink => {
                        let current = *replicas
                            .get(slot)
                            .ok_or_else(|| invalid(format!("no backup at replica {}", index)))?;
                        if event.source.is_some_and(|s| s != current) {
                            return Err(invalid(format!(
                                "source {:?} does not hold replica {}",
                                event.source, index
                            )));
                        }
                        replicas.remove(slot);
                    }
                }
                owner
            }
        };

        validate_layout(self.partition_id, owner, &replicas, max_backups)?;
        Ok((owner, replicas))
    }
}

fn validate_layout(
    partition_id: PartitionId,
    owner: NodeId,
    replicas: &[NodeId],
    max_backups: u32,
) -> Result<()> {
    let invalid = |reason: String| Error::InvalidMigration {
        partition_id,
        reason,
    };
    if replicas.len() > max_backups as usize {
        return Err(invalid(format!(
            "{} backups exceed the backup count {}",
            replicas.len(),
            max_backups
        )));
    }
    if replicas.contains(&owner) {
        return Err(invalid(format!("owner {} is also a backup", owner)));
    }
    for (i, node) in replicas.iter().enumerate() {
        if replicas[i + 1..].contains(node) {
            return Err(invalid(format!("node {} appears twice", node)));
        }
    }
    Ok(())
}

/// The partition table shared by every component of a node.
#[derive(Debug)]
pub struct PartitionTable {
    entries: RwLock<Vec<PartitionTableEntry>>,
    backup_count: u32,
    /// Table-wide modification counter.
    version: AtomicU64,
}

impl PartitionTable {
    /// Create a table with `partition_count` unassigned partitions.
    pub fn new(partition_count: u32, backup_count: u32) -> Self {
        Self {
            entries: RwLock::new((0..partition_count).map(PartitionTableEntry::new).collect()),
            backup_count,
            version: AtomicU64::new(0),
        }
    }

    /// Number of partitions.
    pub fn partition_count(&self) -> u32 {
        self.entries.read().len() as u32
    }

    /// Configured number of backups per partition.
    pub fn backup_count(&self) -> u32 {
        self.backup_count
    }

    /// Table-wide modification counter.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Get a consistent copy of one entry.
    pub fn get(&self, partition_id: PartitionId) -> Result<PartitionTableEntry> {
        self.entries
            .read()
            .get(partition_id as usize)
            .cloned()
            .ok_or_else(|| self.out_of_range(partition_id))
    }

    /// Get a consistent copy of the whole table.
    pub fn snapshot(&self) -> Vec<PartitionTableEntry> {
        self.entries.read().clone()
    }

    /// Check whether a partition is currently migrating.
    pub fn is_migrating(&self, partition_id: PartitionId) -> bool {
        self.entries
            .read()
            .get(partition_id as usize)
            .is_some_and(|e| e.migrating)
    }

    /// Owner of a partition.
    pub fn owner_of(&self, partition_id: PartitionId) -> Option<NodeId> {
        self.entries
            .read()
            .get(partition_id as usize)
            .and_then(|e| e.owner)
    }

    /// Partitions owned by `node`.
    pub fn partitions_owned_by(&self, node: NodeId) -> Vec<PartitionId> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.owner == Some(node))
            .map(|e| e.partition_id)
            .collect()
    }

    /// Route a key to its partition.
    pub fn partition_for_key<K: Hash + ?Sized>(&self, key: &K) -> PartitionId {
        let mut hasher = XxHash64::with_seed(ROUTING_SEED);
        key.hash(&mut hasher);
        (hasher.finish() % self.partition_count() as u64) as PartitionId
    }

    /// Initial assignment of a partition.
    ///
    /// Fails if the partition is migrating.
    pub fn assign(
        &self,
        partition_id: PartitionId,
        owner: NodeId,
        replicas: Vec<NodeId>,
    ) -> Result<()> {
        validate_layout(partition_id, owner, &replicas, self.backup_count)?;
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(partition_id as usize)
            .ok_or_else(|| self.out_of_range(partition_id))?;
        if entry.migrating {
            return Err(Error::PartitionMigrating(partition_id));
        }
        entry.owner = Some(owner);
        entry.replicas = replicas;
        entry.version += 1;
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Set or clear the in-migration flag.
    ///
    /// The flag is advisory for request routing and does not bump versions.
    pub fn set_migrating(&self, partition_id: PartitionId, migrating: bool) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(partition_id as usize)
            .ok_or_else(|| self.out_of_range(partition_id))?;
        entry.migrating = migrating;
        Ok(())
    }

    /// Validate `event` and flag its partition as migrating under one write
    /// lock.
    ///
    /// Fails with [`Error::PartitionMigrating`] if another migration already
    /// holds the flag. Every member sharing this table sees the flag, so at
    /// most one migration per partition is admitted cluster-wide.
    pub fn try_begin_migration(&self, event: &MigrationServiceEvent) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(event.partition_id as usize)
            .ok_or_else(|| self.out_of_range(event.partition_id))?;
        if entry.migrating {
            return Err(Error::PartitionMigrating(event.partition_id));
        }
        entry.migrated(event, self.backup_count)?;
        entry.migrating = true;
        Ok(())
    }

    /// Replace owner and backups of the event's partition atomically.
    ///
    /// Returns the previous entry. Clears the migration flag.
    pub fn apply_migration(
        &self,
        event: &MigrationServiceEvent,
        new_owner: NodeId,
        new_replicas: Vec<NodeId>,
    ) -> Result<PartitionTableEntry> {
        validate_layout(event.partition_id, new_owner, &new_replicas, self.backup_count)?;
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(event.partition_id as usize)
            .ok_or_else(|| self.out_of_range(event.partition_id))?;
        let previous = entry.clone();
        entry.owner = Some(new_owner);
        entry.replicas = new_replicas;
        entry.migrating = false;
        entry.version += 1;
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(previous)
    }

    /// Compute and apply the effect of `event` under one write lock.
    ///
    /// Returns the previous entry.
    pub fn apply_event(&self, event: &MigrationServiceEvent) -> Result<PartitionTableEntry> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(event.partition_id as usize)
            .ok_or_else(|| self.out_of_range(event.partition_id))?;
        let (owner, replicas) = entry.migrated(event, self.backup_count)?;
        let previous = entry.clone();
        entry.owner = Some(owner);
        entry.replicas = replicas;
        entry.migrating = false;
        entry.version += 1;
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(previous)
    }

    fn out_of_range(&self, partition_id: PartitionId) -> Error {
        Error::PartitionOutOfRange {
            partition_id,
            partition_count: self.partition_count(),
        }
    }
}
