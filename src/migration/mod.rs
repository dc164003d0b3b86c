//! Partition migration protocol.
//!
//! # Architecture
//!
//! ```text
//!        source member                               destination member
//! ┌───────────────────────────┐                 ┌───────────────────────────┐
//! │   MigrationCoordinator    │   Migration     │    MigrationReceiver      │
//! │  prepare ─► send ─► commit│── Operation ───►│  apply all payloads       │
//! │      │            ▲       │                 │  (dedupe by migration id) │
//! │      ▼            │       │◄── Ack/Nack ────│                           │
//! │  PartitionExecutor│       │                 │  PartitionExecutor        │
//! │   └─ participants ┘       │                 │   └─ participants         │
//! └───────────────────────────┘                 └───────────────────────────┘
//! ```
//!
//! Participants implement [`MigrationAwareService`] and are registered in a
//! [`ParticipantRegistry`]. The coordinator talks to destinations through a
//! [`MigrationTransport`]; [`ChannelTransport`] adapts a frame pipe owned by
//! the networking layer.

mod coordinator;
mod metrics;
mod operation;
mod participant;
mod receiver;
mod record;
mod transport;

pub use coordinator::{MigrationCoordinator, MigrationStats, MigrationStatus};
pub use metrics::{MigrationMetrics, MigrationMetricsSnapshot};
pub use operation::{MigrationOperation, ServicePayload, TransferOutcome};
pub use participant::{MigrationAwareService, MigrationPayload, ParticipantRegistry};
pub use receiver::MigrationReceiver;
pub use record::{MigrationFailure, MigrationRecord, MigrationReport, MigrationState};
pub use transport::{ChannelTransport, MigrationFrame, MigrationMessage, MigrationTransport};
