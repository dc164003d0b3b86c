//! Partition migration for an in-memory data grid.
//!
//! This crate moves partition replicas between grid members without losing
//! or duplicating data:
//! - **Partition table** holding owner and backups of every partition
//! - **Partition executor** running all work for a partition on one thread
//! - **Migration coordinator** driving prepare, transfer and commit
//! - **Participants** (data services) that snapshot, apply and release state
//!
//! # Features
//!
//! - Per-partition FIFO execution on striped worker threads
//! - Atomic partition table updates, never half applied
//! - Retries with backoff on transfer timeout, reusing the migration id
//! - Duplicate deliveries detected by the destination
//! - Bounded migrations in flight, globally and per destination
//!
//! # Example
//!
//! ```rust,ignore
//! use grid_migration::{MigrationServiceEvent, NodeBuilder, NodeConfig};
//! use grid_migration::services::MapService;
//! use std::sync::Arc;
//!
//! let node = NodeBuilder::new(NodeConfig::new(1).with_partition_count(271))
//!     .with_partition_table(table)
//!     .with_transport(transport)
//!     .register_participant(Arc::new(MapService::new()))
//!     .build()?;
//!
//! // Move the owner of partition 5 from member 1 to member 2.
//! let report = node.migrate(MigrationServiceEvent::move_owner(5, 1, 2)).await?;
//! assert!(report.is_committed());
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                NodeContext                  │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┐
//!     ▼               ▼               ▼
//! ┌──────────┐  ┌───────────┐  ┌────────────┐
//! │Migration │  │ Partition │  │ Migration  │
//! │Coordinator│ │ Executor  │  │ Receiver   │
//! └──────────┘  └───────────┘  └────────────┘
//!     │               │               │
//!     ▼               ▼               ▼
//! ┌──────────┐  ┌───────────┐  ┌────────────┐
//! │Transport │  │Participants│ │ Partition  │
//! │          │  │ (services) │ │  Table     │
//! └──────────┘  └───────────┘  └────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Ownership**: changes only when the destination acknowledged the data
//! - **Rollback**: every prepared participant is rolled back exactly once
//! - **Commit**: never rolled back; cleanup failures are logged and retried

pub mod config;
pub mod error;
pub mod metrics;
pub mod migration;
pub mod node;
pub mod partition;
pub mod services;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use config::{ExecutorConfig, MigrationConfig, NodeConfig};
pub use error::{Error, Result};
pub use node::{NodeBuilder, NodeContext};
pub use types::{MigrationServiceEvent, MigrationType, NodeId, PartitionId, ReplicaIndex};

// Re-export partition types
pub use partition::{
    PartitionContext, PartitionExecutor, PartitionTable, PartitionTableEntry, PartitionTask,
};

// Re-export migration types
pub use migration::{
    ChannelTransport, MigrationAwareService, MigrationCoordinator, MigrationFailure,
    MigrationFrame, MigrationMessage, MigrationMetrics, MigrationMetricsSnapshot,
    MigrationOperation, MigrationPayload, MigrationReceiver, MigrationRecord, MigrationReport,
    MigrationState, MigrationStats, MigrationStatus, MigrationTransport, ParticipantRegistry,
    ServicePayload, TransferOutcome,
};

// Re-export metrics types
pub use metrics::{Counter, Gauge, Histogram, MIGRATION_LATENCY_BUCKETS};

// Re-export testing types
pub use testing::{Fault, LoopbackNetwork, LoopbackTransport, RecordingParticipant, TestCluster};
