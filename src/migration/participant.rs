//! Migration-aware participant contract and registry.
//!
//! Every service that keeps partition-scoped state implements
//! [`MigrationAwareService`] and is registered once at node startup. The
//! coordinator drives the source-side callbacks, the receiver drives the
//! destination-side ones. All callbacks take a [`PartitionContext`], so they
//! can only run on the worker owning the event's partition.

use crate::error::{Error, Result};
use crate::partition::PartitionContext;
use crate::types::MigrationServiceEvent;
use bytes::Bytes;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Opaque transfer object produced by a participant's prepare phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPayload(Bytes);

impl MigrationPayload {
    /// Wrap raw bytes.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    /// Serialize a value with bincode.
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Self> {
        Ok(Self(Bytes::from(bincode::serialize(value)?)))
    }

    /// Deserialize the payload with bincode.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(bincode::deserialize(&self.0)?)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    /// Consume into raw bytes.
    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A service taking part in partition migrations.
///
/// Source side, in order: `before_migration`, `prepare_migration_operation`,
/// then exactly one of `commit_migration` or `rollback_migration`.
/// Destination side: `apply_migration` for the payload this service prepared
/// on the source, and `discard_migration` if a later service's apply failed.
pub trait MigrationAwareService: Send + Sync + fmt::Debug {
    /// Stable tag used to route payloads to the matching service on the destination.
    fn service_name(&self) -> &str;

    /// Notification that a migration for the partition is starting.
    ///
    /// An error aborts the migration for this partition.
    fn before_migration(&self, ctx: &PartitionContext, event: &MigrationServiceEvent)
        -> Result<()>;

    /// Capture the partition state to ship to the destination.
    ///
    /// Must not modify live state. `None` means nothing to transfer.
    fn prepare_migration_operation(
        &self,
        ctx: &PartitionContext,
        event: &MigrationServiceEvent,
    ) -> Result<Option<MigrationPayload>>;

    /// The destination accepted the migration. Release or finalize the source copy.
    ///
    /// Must be idempotent.
    fn commit_migration(&self, ctx: &PartitionContext, event: &MigrationServiceEvent)
        -> Result<()>;

    /// The migration did not complete. Restore the pre-migration state.
    ///
    /// Must be idempotent and a no-op if `prepare_migration_operation` never ran.
    fn rollback_migration(
        &self,
        ctx: &PartitionContext,
        event: &MigrationServiceEvent,
    ) -> Result<()>;

    /// Install a payload received from the source.
    ///
    /// Applying the same payload twice must leave the same state as applying it once.
    fn apply_migration(
        &self,
        _ctx: &PartitionContext,
        _event: &MigrationServiceEvent,
        _payload: &MigrationPayload,
    ) -> Result<()> {
        Err(Error::participant(
            self.service_name(),
            "service does not accept migration payloads",
        ))
    }

    /// Undo a previous `apply_migration` for the same event.
    fn discard_migration(
        &self,
        _ctx: &PartitionContext,
        _event: &MigrationServiceEvent,
    ) -> Result<()> {
        Ok(())
    }
}

/// Run a participant callback, turning a panic into a participant error.
pub(crate) fn guarded<T>(service: &str, callback: impl FnOnce() -> Result<T>) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(result) => result,
        Err(_) => Err(Error::participant(service, "callback panicked")),
    }
}

/// Ordered set of registered participants.
///
/// Registration order drives prepare and commit; rollback walks it in reverse.
#[derive(Debug, Default, Clone)]
pub struct ParticipantRegistry {
    participants: Vec<Arc<dyn MigrationAwareService>>,
}

impl ParticipantRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant. Names must be unique.
    pub fn register(&mut self, participant: Arc<dyn MigrationAwareService>) -> Result<()> {
        let name = participant.service_name();
        if self.get(name).is_some() {
            return Err(Error::DuplicateParticipant(name.to_string()));
        }
        tracing::debug!(service = name, "Registered migration participant");
        self.participants.push(participant);
        Ok(())
    }

    /// Look up a participant by service name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn MigrationAwareService>> {
        self.participants.iter().find(|p| p.service_name() == name)
    }

    /// Participants in registration order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Arc<dyn MigrationAwareService>> {
        self.participants.iter()
    }

    /// Service names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.participants
            .iter()
            .map(|p| p.service_name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
