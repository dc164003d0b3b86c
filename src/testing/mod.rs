//! Testing utilities for migration scenarios.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        TestCluster                           │
//! │                                                              │
//! │   ┌────────────┐     ┌────────────┐     ┌────────────┐       │
//! │   │  node 1    │     │  node 2    │     │  node 3    │       │
//! │   │ map        │     │ map        │     │ map        │       │
//! │   │ counter    │     │ counter    │     │ counter    │       │
//! │   │ recorder   │     │ recorder   │     │ recorder   │       │
//! │   └─────┬──────┘     └─────┬──────┘     └─────┬──────┘       │
//! │         │                  │                  │              │
//! │         ▼                  ▼                  ▼              │
//! │   ┌──────────────────────────────────────────────────────┐   │
//! │   │          LoopbackNetwork (fault injection)           │   │
//! │   └──────────────────────────────────────────────────────┘   │
//! │                  shared PartitionTable                       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The partition table is shared by every node, standing in for the
//! replicated cluster view.

mod network;
mod recording;

#[cfg(test)]
mod migration_tests;
#[cfg(test)]
mod transport_tests;

pub use network::{Fault, LoopbackNetwork, LoopbackTransport};
pub use recording::{Call, Phase, RecordingParticipant};

use crate::config::{MigrationConfig, NodeConfig};
use crate::error::{Error, Result};
use crate::node::{NodeBuilder, NodeContext};
use crate::partition::PartitionTable;
use crate::services::{CounterService, MapService};
use crate::types::{NodeId, PartitionId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Partitions in a test cluster.
pub const TEST_PARTITIONS: u32 = 16;

/// Migration settings with short timeouts and no jitter.
pub fn fast_migration_config() -> MigrationConfig {
    let mut config = MigrationConfig::default()
        .with_ack_timeout(Duration::from_millis(500))
        .with_max_transfer_attempts(3)
        .with_backoff(Duration::from_millis(2), Duration::from_millis(10))
        .with_commit_retry_attempts(2);
    config.backoff_jitter = 0.0;
    config
}

/// One member of a [`TestCluster`].
#[derive(Debug)]
pub struct TestNode {
    pub node: NodeContext,
    pub map: Arc<MapService>,
    pub counters: Arc<CounterService>,
    pub recorder: Arc<RecordingParticipant>,
}

impl TestNode {
    pub fn node_id(&self) -> NodeId {
        self.node.node_id()
    }

    /// Put a map entry directly into `partition_id`.
    pub async fn put(&self, partition_id: PartitionId, key: &str, value: &str) -> Result<()> {
        let map = Arc::clone(&self.map);
        let (key, value) = (key.to_string(), value.to_string());
        self.node
            .execute(partition_id, move |ctx| map.put(ctx, key, value).map(|_| ()))
            .await?
    }

    pub async fn get(&self, partition_id: PartitionId, key: &str) -> Result<Option<String>> {
        let map = Arc::clone(&self.map);
        let key = key.to_string();
        let value = self
            .node
            .execute(partition_id, move |ctx| map.get(ctx, key.as_bytes()))
            .await?;
        Ok(value.map(|v| String::from_utf8_lossy(&v).into_owned()))
    }
}

/// In-process cluster sharing one partition table.
#[derive(Debug)]
pub struct TestCluster {
    table: Arc<PartitionTable>,
    network: Arc<LoopbackNetwork>,
    nodes: BTreeMap<NodeId, TestNode>,
}

impl TestCluster {
    /// Start nodes with the default fast migration settings.
    pub fn new(node_ids: &[NodeId]) -> Result<Self> {
        Self::with_config(node_ids, 1, fast_migration_config())
    }

    pub fn with_config(
        node_ids: &[NodeId],
        backup_count: u32,
        migration: MigrationConfig,
    ) -> Result<Self> {
        let table = Arc::new(PartitionTable::new(TEST_PARTITIONS, backup_count));
        let network = LoopbackNetwork::new();
        let mut nodes = BTreeMap::new();

        for &node_id in node_ids {
            let map = Arc::new(MapService::new());
            let counters = Arc::new(CounterService::new());
            let recorder = RecordingParticipant::new("recorder");

            let config = NodeConfig::new(node_id)
                .with_instance_name(format!("node-{}", node_id))
                .with_partition_count(TEST_PARTITIONS)
                .with_backup_count(backup_count)
                .with_pool_size(2)
                .with_migration_config(migration.clone());
            let node = NodeBuilder::new(config)
                .with_partition_table(Arc::clone(&table))
                .with_transport(network.transport(node_id))
                .register_participant(map.clone())
                .register_participant(counters.clone())
                .register_participant(recorder.clone())
                .build()?;

            network.register(node_id, Arc::clone(node.receiver()));
            nodes.insert(
                node_id,
                TestNode {
                    node,
                    map,
                    counters,
                    recorder,
                },
            );
        }

        Ok(Self {
            table,
            network,
            nodes,
        })
    }

    pub fn table(&self) -> &Arc<PartitionTable> {
        &self.table
    }

    pub fn network(&self) -> &Arc<LoopbackNetwork> {
        &self.network
    }

    pub fn node(&self, node_id: NodeId) -> Result<&TestNode> {
        self.nodes
            .get(&node_id)
            .ok_or_else(|| Error::Internal(format!("no test node {}", node_id)))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TestNode> {
        self.nodes.values()
    }

    pub fn shutdown(&self) {
        for node in self.nodes.values() {
            node.node.shutdown();
        }
    }
}

/// Install a tracing subscriber for test output.
#[cfg(test)]
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}
