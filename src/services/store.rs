//! Partition-scoped storage shared by the built-in services.

use crate::error::{Error, Result};
use crate::migration::MigrationPayload;
use crate::partition::PartitionContext;
use crate::types::PartitionId;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug)]
struct Slot<K, V> {
    entries: BTreeMap<K, V>,
    /// Set between `before_migration` and commit/rollback. Writes are refused.
    frozen: bool,
    /// Contents replaced by the last incoming migration, kept for `discard`.
    replaced: Option<BTreeMap<K, V>>,
}

impl<K, V> Default for Slot<K, V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            frozen: false,
            replaced: None,
        }
    }
}

/// Key/value data split by partition.
///
/// Every method takes the caller's [`PartitionContext`] and only touches that
/// partition's slot, so slots are never shared between workers.
#[derive(Debug)]
pub(crate) struct PartitionedStore<K, V> {
    slots: DashMap<PartitionId, Slot<K, V>>,
}

impl<K, V> PartitionedStore<K, V>
where
    K: Ord + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    pub(crate) fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    pub(crate) fn read<R>(&self, ctx: &PartitionContext, f: impl FnOnce(&BTreeMap<K, V>) -> R) -> R {
        match self.slots.get(&ctx.partition_id()) {
            Some(slot) => f(&slot.entries),
            None => f(&BTreeMap::new()),
        }
    }

    pub(crate) fn write<R>(
        &self,
        ctx: &PartitionContext,
        f: impl FnOnce(&mut BTreeMap<K, V>) -> R,
    ) -> Result<R> {
        let partition_id = ctx.partition_id();
        let mut slot = self.slots.entry(partition_id).or_default();
        if slot.frozen {
            return Err(Error::PartitionMigrating(partition_id));
        }
        slot.replaced = None;
        Ok(f(&mut slot.entries))
    }

    pub(crate) fn is_frozen(&self, partition_id: PartitionId) -> bool {
        self.slots.get(&partition_id).is_some_and(|s| s.frozen)
    }

    pub(crate) fn freeze(&self, ctx: &PartitionContext) {
        let mut slot = self.slots.entry(ctx.partition_id()).or_default();
        slot.frozen = true;
        slot.replaced = None;
    }

    /// Unfreeze; drops the slot again if freezing created it.
    pub(crate) fn thaw(&self, ctx: &PartitionContext) {
        let partition_id = ctx.partition_id();
        if let Some(mut slot) = self.slots.get_mut(&partition_id) {
            slot.frozen = false;
        }
        self.slots
            .remove_if(&partition_id, |_, s| s.entries.is_empty() && s.replaced.is_none());
    }

    /// Encode the partition's entries, `None` if there are none.
    pub(crate) fn snapshot(&self, ctx: &PartitionContext) -> Result<Option<MigrationPayload>> {
        let Some(slot) = self.slots.get(&ctx.partition_id()) else {
            return Ok(None);
        };
        if slot.entries.is_empty() {
            return Ok(None);
        }
        let entries: Vec<(&K, &V)> = slot.entries.iter().collect();
        MigrationPayload::encode(&entries).map(Some)
    }

    /// Drop the partition's data on the source.
    pub(crate) fn release(&self, ctx: &PartitionContext) {
        self.slots.remove(&ctx.partition_id());
    }

    /// Replace the partition's data with a migrated snapshot.
    pub(crate) fn install(&self, ctx: &PartitionContext, payload: &MigrationPayload) -> Result<()> {
        let entries: Vec<(K, V)> = payload.decode()?;
        let mut slot = self.slots.entry(ctx.partition_id()).or_default();
        let previous = std::mem::replace(&mut slot.entries, entries.into_iter().collect());
        // A redelivered install keeps the pre-migration contents.
        if slot.replaced.is_none() {
            slot.replaced = Some(previous);
        }
        Ok(())
    }

    /// Undo the last `install`.
    pub(crate) fn restore(&self, ctx: &PartitionContext) {
        if let Some(mut slot) = self.slots.get_mut(&ctx.partition_id()) {
            if let Some(previous) = slot.replaced.take() {
                slot.entries = previous;
            }
        }
    }

    pub(crate) fn len(&self, partition_id: PartitionId) -> usize {
        self.slots
            .get(&partition_id)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    pub(crate) fn total_len(&self) -> usize {
        self.slots.iter().map(|s| s.entries.len()).sum()
    }
}
