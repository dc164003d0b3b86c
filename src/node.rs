//! Explicitly constructed node context.
//!
//! A [`NodeContext`] owns everything one member needs to take part in
//! migrations: the partition table, the partition executor, the participant
//! registry, the destination-side receiver and the coordinator. It is built
//! once by [`NodeBuilder`] and passed around explicitly; there is no global
//! instance lookup.

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::migration::{
    MigrationAwareService, MigrationCoordinator, MigrationMetrics, MigrationReceiver,
    MigrationReport, MigrationTransport, ParticipantRegistry,
};
use crate::partition::{PartitionContext, PartitionExecutor, PartitionTable};
use crate::types::{MigrationServiceEvent, NodeId, PartitionId};
use std::sync::Arc;

/// Builder for a [`NodeContext`].
#[derive(Debug)]
pub struct NodeBuilder {
    config: NodeConfig,
    table: Option<Arc<PartitionTable>>,
    participants: Vec<Arc<dyn MigrationAwareService>>,
    transport: Option<Arc<dyn MigrationTransport>>,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            table: None,
            participants: Vec::new(),
            transport: None,
        }
    }

    /// Use an existing partition table instead of creating an empty one.
    pub fn with_partition_table(mut self, table: Arc<PartitionTable>) -> Self {
        self.table = Some(table);
        self
    }

    /// Set the transport used to reach destination members.
    pub fn with_transport(mut self, transport: Arc<dyn MigrationTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Register a migration-aware service. Order of registration is the
    /// order participants are prepared and committed in.
    pub fn register_participant(mut self, participant: Arc<dyn MigrationAwareService>) -> Self {
        self.participants.push(participant);
        self
    }

    /// Validate the configuration and start the node.
    pub fn build(self) -> Result<NodeContext> {
        self.config.validate()?;
        let config = self.config;

        let table = match self.table {
            Some(table) => {
                if table.partition_count() != config.partition_count {
                    return Err(Error::Config(format!(
                        "partition table has {} partitions, config expects {}",
                        table.partition_count(),
                        config.partition_count
                    )));
                }
                if table.backup_count() != config.backup_count {
                    return Err(Error::Config(format!(
                        "partition table keeps {} backups, config expects {}",
                        table.backup_count(),
                        config.backup_count
                    )));
                }
                table
            }
            None => Arc::new(PartitionTable::new(
                config.partition_count,
                config.backup_count,
            )),
        };

        let transport = self
            .transport
            .ok_or_else(|| Error::Config("migration transport not set".into()))?;

        let mut registry = ParticipantRegistry::new();
        for participant in self.participants {
            registry.register(participant)?;
        }
        let registry = Arc::new(registry);

        let executor = Arc::new(PartitionExecutor::new(
            &config.executor,
            config.partition_count,
            &config.instance_name,
        )?);
        let metrics = Arc::new(MigrationMetrics::new());

        let receiver = Arc::new(MigrationReceiver::new(
            config.node_id,
            Arc::clone(&executor),
            Arc::clone(&registry),
            config.migration.dedupe_capacity,
            Arc::clone(&metrics),
        ));
        let coordinator = Arc::new(MigrationCoordinator::new(
            config.node_id,
            config.migration.clone(),
            Arc::clone(&table),
            Arc::clone(&executor),
            Arc::clone(&registry),
            transport,
            Arc::clone(&metrics),
        ));

        tracing::info!(
            node_id = config.node_id,
            instance = %config.instance_name,
            partitions = config.partition_count,
            pool_size = config.executor.pool_size,
            participants = ?registry.names(),
            "Node started"
        );

        Ok(NodeContext {
            config,
            table,
            executor,
            registry,
            receiver,
            coordinator,
            metrics,
        })
    }
}

/// A running member.
#[derive(Debug)]
pub struct NodeContext {
    config: NodeConfig,
    table: Arc<PartitionTable>,
    executor: Arc<PartitionExecutor>,
    registry: Arc<ParticipantRegistry>,
    receiver: Arc<MigrationReceiver>,
    coordinator: Arc<MigrationCoordinator>,
    metrics: Arc<MigrationMetrics>,
}

impl NodeContext {
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn partition_table(&self) -> &Arc<PartitionTable> {
        &self.table
    }

    pub fn executor(&self) -> &Arc<PartitionExecutor> {
        &self.executor
    }

    pub fn registry(&self) -> &Arc<ParticipantRegistry> {
        &self.registry
    }

    /// Handler for migration operations arriving from other members.
    pub fn receiver(&self) -> &Arc<MigrationReceiver> {
        &self.receiver
    }

    pub fn coordinator(&self) -> &Arc<MigrationCoordinator> {
        &self.coordinator
    }

    pub fn metrics(&self) -> &Arc<MigrationMetrics> {
        &self.metrics
    }

    /// Run a partition operation on the partition's worker.
    pub async fn execute<F, R>(&self, partition_id: PartitionId, task: F) -> Result<R>
    where
        F: FnOnce(&PartitionContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.executor.execute(partition_id, task).await
    }

    /// Run a single migration whose source is this node.
    pub async fn migrate(&self, event: MigrationServiceEvent) -> Result<MigrationReport> {
        self.coordinator.migrate(event).await
    }

    /// Run a batch of migrations.
    pub async fn execute_plan(&self, events: Vec<MigrationServiceEvent>) -> Vec<MigrationReport> {
        self.coordinator.execute_plan(events).await
    }

    /// Stop the coordinator and the partition workers.
    pub fn shutdown(&self) {
        self.coordinator.shutdown();
        self.executor.shutdown();
        tracing::info!(node_id = self.config.node_id, "Node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{LoopbackNetwork, RecordingParticipant};

    fn config() -> NodeConfig {
        NodeConfig::new(1)
            .with_instance_name("node-1")
            .with_partition_count(8)
            .with_pool_size(2)
    }

    #[tokio::test]
    async fn test_build_requires_transport() {
        let err = NodeBuilder::new(config()).build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_build_rejects_duplicate_participants() {
        let network = LoopbackNetwork::new();
        let err = NodeBuilder::new(config())
            .with_transport(network.transport(1))
            .register_participant(RecordingParticipant::new("map"))
            .register_participant(RecordingParticipant::new("map"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateParticipant(_)));
    }

    #[tokio::test]
    async fn test_build_rejects_mismatched_table() {
        let network = LoopbackNetwork::new();
        let err = NodeBuilder::new(config())
            .with_partition_table(Arc::new(PartitionTable::new(4, 1)))
            .with_transport(network.transport(1))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_build_rejects_table_with_other_backup_count() {
        let network = LoopbackNetwork::new();
        let err = NodeBuilder::new(config())
            .with_partition_table(Arc::new(PartitionTable::new(8, 2)))
            .with_transport(network.transport(1))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("backups")));
    }

    #[tokio::test]
    async fn test_node_executes_partition_tasks() {
        let network = LoopbackNetwork::new();
        let node = NodeBuilder::new(config())
            .with_transport(network.transport(1))
            .register_participant(RecordingParticipant::new("map"))
            .build()
            .unwrap();

        assert_eq!(node.node_id(), 1);
        assert_eq!(node.registry().names(), vec!["map"]);
        let partition = node.execute(7, |ctx| ctx.partition_id()).await.unwrap();
        assert_eq!(partition, 7);

        node.shutdown();
        assert!(node.execute(7, |_| ()).await.is_err());
    }
}
