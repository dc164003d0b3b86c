//! Partitioned named counters.

use super::store::PartitionedStore;
use crate::error::Result;
use crate::migration::{MigrationAwareService, MigrationPayload};
use crate::partition::PartitionContext;
use crate::types::{MigrationServiceEvent, MigrationType, PartitionId};

/// Named 64-bit counters, each living in the partition its name hashes to.
#[derive(Debug)]
pub struct CounterService {
    name: String,
    store: PartitionedStore<String, i64>,
}

impl CounterService {
    pub const DEFAULT_NAME: &'static str = "counter";

    pub fn new() -> Self {
        Self {
            name: Self::DEFAULT_NAME.to_string(),
            store: PartitionedStore::new(),
        }
    }

    pub fn get(&self, ctx: &PartitionContext, counter: &str) -> i64 {
        self.store
            .read(ctx, |counters| counters.get(counter).copied().unwrap_or(0))
    }

    /// Add `delta` and return the new value.
    pub fn add_and_get(&self, ctx: &PartitionContext, counter: &str, delta: i64) -> Result<i64> {
        self.store.write(ctx, |counters| {
            let value = counters.entry(counter.to_string()).or_insert(0);
            *value = value.wrapping_add(delta);
            *value
        })
    }

    pub fn set(&self, ctx: &PartitionContext, counter: &str, value: i64) -> Result<()> {
        self.store.write(ctx, |counters| {
            counters.insert(counter.to_string(), value);
        })
    }

    pub fn partition_len(&self, partition_id: PartitionId) -> usize {
        self.store.len(partition_id)
    }
}

impl Default for CounterService {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationAwareService for CounterService {
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
        match event.migration_type {
            MigrationType::Shrink => Ok(None),
            MigrationType::Move | MigrationType::Copy => self.store.snapshot(ctx),
        }
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
