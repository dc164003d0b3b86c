//! Partitioned key/value map service.

use super::store::PartitionedStore;
use crate::error::Result;
use crate::migration::{MigrationAwareService, MigrationPayload};
use crate::partition::PartitionContext;
use crate::types::{MigrationServiceEvent, MigrationType, PartitionId};

/// Key/value map whose entries live in the partition owning the key.
///
/// Writes to a partition are refused with
/// [`Error::PartitionMigrating`](crate::Error::PartitionMigrating) from
/// `before_migration` until the migration commits or rolls back.
#[derive(Debug)]
pub struct MapService {
    name: String,
    store: PartitionedStore<Vec<u8>, Vec<u8>>,
}

impl MapService {
    pub const DEFAULT_NAME: &'static str = "map";

    pub fn new() -> Self {
        Self::with_name(Self::DEFAULT_NAME)
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store: PartitionedStore::new(),
        }
    }

    /// Insert a value, returning the previous one.
    pub fn put(
        &self,
        ctx: &PartitionContext,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<Option<Vec<u8>>> {
        let (key, value) = (key.into(), value.into());
        self.store.write(ctx, |entries| entries.insert(key, value))
    }

    pub fn get(&self, ctx: &PartitionContext, key: &[u8]) -> Option<Vec<u8>> {
        self.store.read(ctx, |entries| entries.get(key).cloned())
    }

    pub fn remove(&self, ctx: &PartitionContext, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.store.write(ctx, |entries| entries.remove(key))
    }

    /// Keys stored in the context's partition, in order.
    pub fn keys(&self, ctx: &PartitionContext) -> Vec<Vec<u8>> {
        self.store.read(ctx, |entries| entries.keys().cloned().collect())
    }

    /// Number of entries in a partition.
    pub fn partition_len(&self, partition_id: PartitionId) -> usize {
        self.store.len(partition_id)
    }

    /// Number of entries across all partitions.
    pub fn len(&self) -> usize {
        self.store.total_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether writes to the partition are currently refused.
    pub fn is_frozen(&self, partition_id: PartitionId) -> bool {
        self.store.is_frozen(partition_id)
    }
}

impl Default for MapService {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationAwareService for MapService {
    fn service_name(&self) -> &str {
        &self.name
    }

    fn before_migration(&self, ctx: &PartitionContext, _event: &MigrationServiceEvent) -> Result<()> {
        self.store.freeze(ctx);
        Ok(())
    }

    fn prepare_migration_operation(
        &self,
        ctx: &PartitionContext,
        event: &MigrationServiceEvent,
    ) -> Result<Option<MigrationPayload>> {
        if event.migration_type == MigrationType::Shrink {
            return Ok(None);
        }
        self.store.snapshot(ctx)
    }

    fn commit_migration(&self, ctx: &PartitionContext, event: &MigrationServiceEvent) -> Result<()> {
        if event.releases_source() {
            self.store.release(ctx);
        } else {
            self.store.thaw(ctx);
        }
        Ok(())
    }

    fn rollback_migration(&self, ctx: &PartitionContext, _event: &MigrationServiceEvent) -> Result<()> {
        self.store.thaw(ctx);
        Ok(())
    }

    fn apply_migration(
        &self,
        ctx: &PartitionContext,
        _event: &MigrationServiceEvent,
        payload: &MigrationPayload,
    ) -> Result<()> {
        self.store.install(ctx, payload)
    }

    fn discard_migration(&self, ctx: &PartitionContext, _event: &MigrationServiceEvent) -> Result<()> {
        self.store.restore(ctx);
        Ok(())
    }
}
