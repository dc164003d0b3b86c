//! Migration records, states and reports.

use crate::error::{Error, Result};
use crate::migration::operation::ServicePayload;
use crate::types::{MigrationServiceEvent, PartitionId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// State of a migration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationState {
    /// Accepted, nothing invoked yet.
    Pending,
    /// Participants are running `before_migration` and `prepare`.
    Preparing,
    /// All payloads collected.
    Prepared,
    /// The composite operation is on the wire.
    Committing,
    /// Destination applied the operation and the table was updated.
    Committed,
    /// Transfer failed or was cancelled; participants were rolled back.
    RolledBack,
    /// A participant failed during preparation.
    Failed,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationState::Pending => write!(f, "pending"),
            MigrationState::Preparing => write!(f, "preparing"),
            MigrationState::Prepared => write!(f, "prepared"),
            MigrationState::Committing => write!(f, "committing"),
            MigrationState::Committed => write!(f, "committed"),
            MigrationState::RolledBack => write!(f, "rolled_back"),
            MigrationState::Failed => write!(f, "failed"),
        }
    }
}

impl MigrationState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationState::Committed | MigrationState::RolledBack | MigrationState::Failed
        )
    }

    /// Check if the migration can still be cancelled.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            MigrationState::Pending | MigrationState::Preparing | MigrationState::Prepared
        )
    }

    /// Check whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: MigrationState) -> bool {
        use MigrationState::*;
        matches!(
            (self, next),
            (Pending, Preparing)
                | (Pending, Failed)
                | (Pending, RolledBack)
                | (Preparing, Prepared)
                | (Preparing, Failed)
                | (Preparing, RolledBack)
                | (Prepared, Committing)
                | (Prepared, RolledBack)
                | (Committing, Committed)
                | (Committing, RolledBack)
        )
    }
}

/// Why a migration did not commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationFailure {
    /// A participant failed in `before_migration` or `prepare`.
    Preparation { service: String, reason: String },
    /// The destination never acknowledged.
    TransferTimeout { attempts: u32 },
    /// The destination refused the operation.
    TransferRejected { reason: String },
    /// The transport reported a hard failure.
    Transport { reason: String },
    /// Cancelled before the operation was sent.
    Cancelled,
    /// Not attempted because an earlier migration of the partition did not commit.
    Skipped { reason: String },
    /// The event could not be admitted.
    Rejected { reason: String },
}

impl fmt::Display for MigrationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationFailure::Preparation { service, reason } => {
                write!(f, "preparation failed in {}: {}", service, reason)
            }
            MigrationFailure::TransferTimeout { attempts } => {
                write!(f, "transfer timed out after {} attempts", attempts)
            }
            MigrationFailure::TransferRejected { reason } => {
                write!(f, "transfer rejected: {}", reason)
            }
            MigrationFailure::Transport { reason } => write!(f, "transport failure: {}", reason),
            MigrationFailure::Cancelled => write!(f, "cancelled"),
            MigrationFailure::Skipped { reason } => write!(f, "skipped: {}", reason),
            MigrationFailure::Rejected { reason } => write!(f, "rejected: {}", reason),
        }
    }
}

/// A migration in flight, owned by the task running it.
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    /// Identity token, reused on every transfer attempt.
    pub id: Uuid,
    pub event: MigrationServiceEvent,
    pub state: MigrationState,
    /// Transfer attempts made so far.
    pub attempts: u32,
    /// Prepared payloads in registration order.
    pub payloads: Vec<ServicePayload>,
    pub started_at: Instant,
}

impl MigrationRecord {
    /// Create a pending record.
    pub fn new(event: MigrationServiceEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            event,
            state: MigrationState::Pending,
            attempts: 0,
            payloads: Vec::new(),
            started_at: Instant::now(),
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.event.partition_id
    }

    /// Move to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: MigrationState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "illegal migration transition {} -> {}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Build the final report for a terminal record.
    pub fn report(
        &self,
        failure: Option<MigrationFailure>,
        commit_failures: Vec<String>,
    ) -> MigrationReport {
        MigrationReport {
            migration_id: self.id,
            event: self.event.clone(),
            state: self.state,
            attempts: self.attempts,
            failure,
            commit_failures,
            duration: self.started_at.elapsed(),
        }
    }
}

/// Outcome of one migration.
#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub migration_id: Uuid,
    pub event: MigrationServiceEvent,
    pub state: MigrationState,
    pub attempts: u32,
    pub failure: Option<MigrationFailure>,
    /// Services whose source-side commit kept failing after the table was updated.
    pub commit_failures: Vec<String>,
    pub duration: Duration,
}

impl MigrationReport {
    /// Report for an event that never started.
    pub fn not_started(event: MigrationServiceEvent, failure: MigrationFailure) -> Self {
        Self {
            migration_id: Uuid::new_v4(),
            event,
            state: MigrationState::Failed,
            attempts: 0,
            failure: Some(failure),
            commit_failures: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.state == MigrationState::Committed
    }

    /// Convert into a `Result` using the error taxonomy.
    pub fn into_result(self) -> Result<MigrationReport> {
        let destination = self.event.destination;
        match &self.failure {
            None => Ok(self),
            Some(MigrationFailure::Preparation { service, reason }) => Err(Error::Participant {
                service: service.clone(),
                reason: reason.clone(),
            }),
            Some(MigrationFailure::TransferTimeout { attempts }) => Err(Error::TransferTimeout {
                destination,
                attempts: *attempts,
            }),
            Some(MigrationFailure::TransferRejected { reason }) => Err(Error::TransferRejected {
                destination,
                reason: reason.clone(),
            }),
            Some(MigrationFailure::Transport { reason }) => Err(Error::Transport(reason.clone())),
            Some(MigrationFailure::Cancelled) => Err(Error::Cancelled),
            Some(MigrationFailure::Skipped { reason })
            | Some(MigrationFailure::Rejected { reason }) => Err(Error::InvalidMigration {
                partition_id: self.event.partition_id,
                reason: reason.clone(),
            }),
        }
    }
}
