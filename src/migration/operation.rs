//! Composite migration operation and transfer outcomes.

use crate::error::Result;
use crate::migration::participant::MigrationPayload;
use crate::types::{MigrationServiceEvent, PartitionId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One participant's prepared payload, tagged with its service name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePayload {
    pub service: String,
    pub data: Bytes,
}

impl ServicePayload {
    pub fn new(service: impl Into<String>, payload: MigrationPayload) -> Self {
        Self {
            service: service.into(),
            data: payload.into_bytes(),
        }
    }

    /// View the data as a participant payload.
    pub fn payload(&self) -> MigrationPayload {
        MigrationPayload::new(self.data.clone())
    }
}

/// Everything the destination needs to apply one migration event.
///
/// `migration_id` stays the same across retries so the destination can
/// recognise duplicated deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationOperation {
    pub migration_id: Uuid,
    pub event: MigrationServiceEvent,
    /// 1-based transfer attempt.
    pub attempt: u32,
    /// Payloads in source registration order.
    pub payloads: Vec<ServicePayload>,
}

impl MigrationOperation {
    pub fn new(
        migration_id: Uuid,
        event: MigrationServiceEvent,
        attempt: u32,
        payloads: Vec<ServicePayload>,
    ) -> Self {
        Self {
            migration_id,
            event,
            attempt,
            payloads,
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.event.partition_id
    }

    /// Total payload size in bytes.
    pub fn payload_bytes(&self) -> usize {
        self.payloads.iter().map(|p| p.data.len()).sum()
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Result of one transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferOutcome {
    /// The destination applied every payload.
    Ack,
    /// The destination refused the operation.
    Nack(String),
    /// No answer within the deadline.
    Timeout,
}

impl TransferOutcome {
    pub fn is_ack(&self) -> bool {
        matches!(self, TransferOutcome::Ack)
    }
}
