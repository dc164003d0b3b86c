//! Destination side of a migration.

use crate::migration::metrics::MigrationMetrics;
use crate::migration::operation::{MigrationOperation, TransferOutcome};
use crate::migration::participant::{guarded, ParticipantRegistry};
use crate::partition::PartitionExecutor;
use crate::types::NodeId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

/// Outcomes of recently handled migrations, keyed by migration id.
#[derive(Debug)]
struct HandledMigrations {
    outcomes: HashMap<Uuid, TransferOutcome>,
    order: VecDeque<Uuid>,
    capacity: usize,
}

impl HandledMigrations {
    fn new(capacity: usize) -> Self {
        Self {
            outcomes: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, id: &Uuid) -> Option<TransferOutcome> {
        self.outcomes.get(id).cloned()
    }

    fn insert(&mut self, id: Uuid, outcome: TransferOutcome) {
        if self.outcomes.insert(id, outcome).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.outcomes.remove(&old);
            }
        }
    }
}

/// Applies incoming migration operations to local participants.
///
/// All payloads of one operation are applied in a single partition task, so
/// client operations on the partition never see half of a migration. If any
/// service fails, the services applied before it are discarded in reverse
/// order and the operation is refused. Outcomes are remembered per migration
/// id; a redelivered operation gets the first answer without being applied
/// again.
#[derive(Debug)]
pub struct MigrationReceiver {
    node_id: NodeId,
    executor: Arc<PartitionExecutor>,
    registry: Arc<ParticipantRegistry>,
    handled: Arc<Mutex<HandledMigrations>>,
    metrics: Arc<MigrationMetrics>,
}

impl MigrationReceiver {
    pub fn new(
        node_id: NodeId,
        executor: Arc<PartitionExecutor>,
        registry: Arc<ParticipantRegistry>,
        dedupe_capacity: usize,
        metrics: Arc<MigrationMetrics>,
    ) -> Self {
        Self {
            node_id,
            executor,
            registry,
            handled: Arc::new(Mutex::new(HandledMigrations::new(dedupe_capacity))),
            metrics,
        }
    }

    /// Whether an outcome for this migration id is remembered.
    pub fn has_handled(&self, migration_id: &Uuid) -> bool {
        self.handled.lock().get(migration_id).is_some()
    }

    /// Apply an operation and report the outcome to send back to the source.
    pub async fn handle(&self, operation: MigrationOperation) -> TransferOutcome {
        let migration_id = operation.migration_id;
        let partition_id = operation.partition_id();
        let attempt = operation.attempt;

        if operation.event.destination != self.node_id {
            tracing::warn!(
                node_id = self.node_id,
                %migration_id,
                destination = operation.event.destination,
                "Refusing migration addressed to another node"
            );
            return TransferOutcome::Nack(format!(
                "node {} is not the destination {}",
                self.node_id, operation.event.destination
            ));
        }

        if let Some(unknown) = operation
            .payloads
            .iter()
            .find(|p| self.registry.get(&p.service).is_none())
        {
            tracing::warn!(
                node_id = self.node_id,
                %migration_id,
                service = %unknown.service,
                "Refusing migration for unknown service"
            );
            return TransferOutcome::Nack(format!("unknown service {}", unknown.service));
        }

        let registry = Arc::clone(&self.registry);
        let handled = Arc::clone(&self.handled);
        let metrics = Arc::clone(&self.metrics);
        let result = self
            .executor
            .execute(partition_id, move |ctx| {
                if let Some(outcome) = handled.lock().get(&migration_id) {
                    metrics.record_duplicate();
                    tracing::debug!(%migration_id, partition_id, "Duplicate migration delivery");
                    return outcome;
                }

                let event = &operation.event;
                let mut applied = Vec::with_capacity(operation.payloads.len());
                let mut outcome = TransferOutcome::Ack;
                for entry in &operation.payloads {
                    let Some(participant) = registry.get(&entry.service) else {
                        outcome = TransferOutcome::Nack(format!("unknown service {}", entry.service));
                        break;
                    };
                    let payload = entry.payload();
                    match guarded(&entry.service, || {
                        participant.apply_migration(ctx, event, &payload)
                    }) {
                        Ok(()) => applied.push(participant),
                        Err(e) => {
                            outcome = TransferOutcome::Nack(e.to_string());
                            break;
                        }
                    }
                }

                if !outcome.is_ack() {
                    for participant in applied.iter().rev() {
                        let service = participant.service_name();
                        if let Err(e) = guarded(service, || participant.discard_migration(ctx, event)) {
                            tracing::error!(
                                %migration_id,
                                partition_id,
                                service,
                                error = %e,
                                "Failed to discard partially applied migration"
                            );
                        }
                    }
                }

                handled.lock().insert(migration_id, outcome.clone());
                outcome
            })
            .await;

        match result {
            Ok(outcome) => {
                match &outcome {
                    TransferOutcome::Ack => {
                        tracing::info!(
                            node_id = self.node_id,
                            %migration_id,
                            partition_id,
                            attempt,
                            "Applied incoming migration"
                        );
                    }
                    TransferOutcome::Nack(reason) => {
                        tracing::warn!(
                            node_id = self.node_id,
                            %migration_id,
                            partition_id,
                            reason = %reason,
                            "Rejected incoming migration"
                        );
                    }
                    TransferOutcome::Timeout => {}
                }
                outcome
            }
            Err(e) => TransferOutcome::Nack(e.to_string()),
        }
    }
}
