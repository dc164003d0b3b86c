//! Migrations over [`ChannelTransport`](crate::migration::ChannelTransport)
//! with frames serialized on the way.

#[cfg(test)]
mod tests {
    use crate::config::NodeConfig;
    use crate::migration::{
        ChannelTransport, MigrationFrame, MigrationReceiver, MigrationState,
    };
    use crate::node::{NodeBuilder, NodeContext};
    use crate::partition::PartitionTable;
    use crate::services::MapService;
    use crate::testing::{fast_migration_config, init_tracing};
    use crate::types::{MigrationServiceEvent, NodeId};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct WireNode {
        node: NodeContext,
        map: Arc<MapService>,
    }

    type Endpoints = Arc<Mutex<HashMap<NodeId, (Arc<ChannelTransport>, Arc<MigrationReceiver>)>>>;

    /// Deliver every outbound frame of `node` through bytes, dropping the
    /// first `drop_responses` responses.
    fn pump(
        mut outbound: mpsc::UnboundedReceiver<MigrationFrame>,
        endpoints: Endpoints,
        drop_responses: usize,
    ) {
        tokio::spawn(async move {
            let mut dropped = 0;
            while let Some(frame) = outbound.recv().await {
                let bytes = frame.to_bytes().unwrap();
                let frame = MigrationFrame::from_bytes(&bytes).unwrap();
                let target = endpoints.lock().get(&frame.destination).cloned();
                let Some((transport, receiver)) = target else {
                    continue;
                };
                let Some(response) = transport.handle_frame(frame, &receiver).await else {
                    continue;
                };
                if dropped < drop_responses {
                    dropped += 1;
                    continue;
                }
                let bytes = response.to_bytes().unwrap();
                let response = MigrationFrame::from_bytes(&bytes).unwrap();
                let origin = endpoints.lock().get(&response.destination).cloned();
                if let Some((transport, receiver)) = origin {
                    transport.handle_frame(response, &receiver).await;
                }
            }
        });
    }

    fn wire_cluster(drop_responses: usize) -> (Arc<PartitionTable>, HashMap<NodeId, WireNode>) {
        init_tracing();
        let table = Arc::new(PartitionTable::new(8, 1));
        let endpoints: Endpoints = Arc::new(Mutex::new(HashMap::new()));
        let mut nodes = HashMap::new();

        for node_id in [1, 2] {
            let (tx, rx) = mpsc::unbounded_channel();
            let transport = Arc::new(ChannelTransport::new(node_id, tx, Duration::from_millis(200)));
            let map = Arc::new(MapService::new());
            let config = NodeConfig::new(node_id)
                .with_instance_name(format!("wire-{}", node_id))
                .with_partition_count(8)
                .with_pool_size(1)
                .with_migration_config(fast_migration_config());
            let node = NodeBuilder::new(config)
                .with_partition_table(Arc::clone(&table))
                .with_transport(transport.clone())
                .register_participant(map.clone())
                .build()
                .unwrap();

            endpoints
                .lock()
                .insert(node_id, (transport, Arc::clone(node.receiver())));
            pump(rx, endpoints.clone(), drop_responses);
            nodes.insert(node_id, WireNode { node, map });
        }
        (table, nodes)
    }

    #[tokio::test]
    async fn test_move_over_channel_transport() {
        let (table, nodes) = wire_cluster(0);
        table.assign(3, 1, vec![]).unwrap();
        let (source, destination) = (&nodes[&1], &nodes[&2]);

        let map = source.map.clone();
        source
            .node
            .execute(3, move |ctx| map.put(ctx, "k", "v").map(|_| ()))
            .await
            .unwrap()
            .unwrap();

        let report = source
            .node
            .migrate(MigrationServiceEvent::move_owner(3, 1, 2))
            .await
            .unwrap();

        assert_eq!(report.state, MigrationState::Committed);
        assert_eq!(table.owner_of(3), Some(2));
        assert_eq!(source.map.partition_len(3), 0);
        assert_eq!(destination.map.partition_len(3), 1);
    }

    #[tokio::test]
    async fn test_lost_response_is_retried_over_channel_transport() {
        let (table, nodes) = wire_cluster(1);
        table.assign(3, 1, vec![]).unwrap();
        let (source, destination) = (&nodes[&1], &nodes[&2]);

        let map = source.map.clone();
        source
            .node
            .execute(3, move |ctx| map.put(ctx, "k", "v").map(|_| ()))
            .await
            .unwrap()
            .unwrap();

        let report = source
            .node
            .migrate(MigrationServiceEvent::move_owner(3, 1, 2))
            .await
            .unwrap();

        assert!(report.is_committed());
        assert_eq!(report.attempts, 2);
        assert_eq!(destination.node.metrics().snapshot().duplicates, 1);
        assert_eq!(destination.map.partition_len(3), 1);
    }
}
