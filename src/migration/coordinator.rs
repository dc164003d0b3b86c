//! Migration coordinator.
//!
//! Drives one migration record per partition through
//! `Pending -> Preparing -> Prepared -> Committing -> Committed`, falling back
//! to `RolledBack` (transfer failed, cancelled) or `Failed` (a participant
//! could not prepare).
//!
//! ```text
//!                 ┌──────────── cancel ─────────────┐
//!                 │                                 ▼
//!  Pending ──► Preparing ──► Prepared ──► Committing ──► Committed
//!                 │                           │
//!                 ▼                           ▼
//!               Failed                    RolledBack
//! ```
//!
//! Every participant callback runs as a task on the partition executor. The
//! coordinator itself is async: it submits a segment, awaits it, and while it
//! waits for the destination the partition worker keeps serving other work.
//! The commit segment applies the partition table update and the source-side
//! commits in one task, so no partition operation observes one without the
//! other.

use crate::config::MigrationConfig;
use crate::error::{Error, Result};
use crate::migration::metrics::MigrationMetrics;
use crate::migration::operation::{MigrationOperation, ServicePayload, TransferOutcome};
use crate::migration::participant::{guarded, MigrationAwareService, ParticipantRegistry};
use crate::migration::record::{MigrationFailure, MigrationRecord, MigrationReport, MigrationState};
use crate::migration::transport::MigrationTransport;
use crate::partition::{PartitionExecutor, PartitionTable};
use crate::types::{MigrationServiceEvent, NodeId, PartitionId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Read-only view of an in-flight migration.
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    pub migration_id: Uuid,
    pub event: MigrationServiceEvent,
    pub state: MigrationState,
    pub attempts: u32,
    pub started_at: Instant,
}

#[derive(Debug)]
struct ActiveMigration {
    status: MigrationStatus,
    cancel: CancellationToken,
}

/// Statistics about migrations driven by this node.
#[derive(Debug, Clone, Default)]
pub struct MigrationStats {
    pub active: usize,
    pub history: usize,
    pub paused: bool,
    pub started: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub failed: u64,
}

/// Drives migrations whose source is the local node.
#[derive(Debug)]
pub struct MigrationCoordinator {
    node_id: NodeId,
    config: MigrationConfig,
    table: Arc<PartitionTable>,
    executor: Arc<PartitionExecutor>,
    registry: Arc<ParticipantRegistry>,
    transport: Arc<dyn MigrationTransport>,
    /// At most one non-terminal record per partition.
    active: DashMap<PartitionId, ActiveMigration>,
    history: Mutex<VecDeque<MigrationReport>>,
    paused: AtomicBool,
    global_slots: Arc<Semaphore>,
    destination_slots: DashMap<NodeId, Arc<Semaphore>>,
    metrics: Arc<MigrationMetrics>,
    shutdown: CancellationToken,
}

impl MigrationCoordinator {
    pub fn new(
        node_id: NodeId,
        config: MigrationConfig,
        table: Arc<PartitionTable>,
        executor: Arc<PartitionExecutor>,
        registry: Arc<ParticipantRegistry>,
        transport: Arc<dyn MigrationTransport>,
        metrics: Arc<MigrationMetrics>,
    ) -> Self {
        Self {
            node_id,
            global_slots: Arc::new(Semaphore::new(config.max_concurrent_migrations)),
            config,
            table,
            executor,
            registry,
            transport,
            active: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            paused: AtomicBool::new(false),
            destination_slots: DashMap::new(),
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MigrationMetrics> {
        &self.metrics
    }

    /// Check if migrations are paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Stop accepting new migrations. In-flight migrations continue.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.metrics.set_paused(true);
        tracing::warn!(node_id = self.node_id, "Migration coordinator paused");
    }

    /// Accept new migrations again.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.metrics.set_paused(false);
        tracing::info!(node_id = self.node_id, "Migration coordinator resumed");
    }

    /// Number of non-terminal migrations.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Check if a partition has a non-terminal migration.
    pub fn is_migrating(&self, partition_id: PartitionId) -> bool {
        self.active.contains_key(&partition_id)
    }

    /// State of the partition's in-flight migration.
    pub fn migration_state(&self, partition_id: PartitionId) -> Option<MigrationState> {
        self.active.get(&partition_id).map(|a| a.status.state)
    }

    /// Get the partition's in-flight migration.
    pub fn get_migration(&self, partition_id: PartitionId) -> Option<MigrationStatus> {
        self.active.get(&partition_id).map(|a| a.status.clone())
    }

    /// All in-flight migrations.
    pub fn active_migrations(&self) -> Vec<MigrationStatus> {
        self.active.iter().map(|a| a.status.clone()).collect()
    }

    /// Reports of recently finished migrations, oldest first.
    pub fn history(&self) -> Vec<MigrationReport> {
        self.history.lock().iter().cloned().collect()
    }

    /// Migrations that can still be admitted towards `destination`.
    pub fn available_slots(&self, destination: NodeId) -> usize {
        self.destination_slots
            .get(&destination)
            .map(|s| s.available_permits())
            .unwrap_or(self.config.max_in_flight_per_destination)
            .min(self.global_slots.available_permits())
    }

    pub fn stats(&self) -> MigrationStats {
        let snapshot = self.metrics.snapshot();
        MigrationStats {
            active: self.active.len(),
            history: self.history.lock().len(),
            paused: self.is_paused(),
            started: snapshot.started,
            committed: snapshot.committed,
            rolled_back: snapshot.rolled_back,
            failed: snapshot.failed,
        }
    }

    /// Cancel the partition's migration if it has not reached `Committing`.
    ///
    /// The migration ends `RolledBack`; participants that already ran are
    /// rolled back. Returns the id of the cancelled migration.
    pub fn cancel_migration(&self, partition_id: PartitionId) -> Result<Uuid> {
        let active = self
            .active
            .get_mut(&partition_id)
            .ok_or(Error::MigrationNotFound(partition_id))?;
        if !active.status.state.is_cancellable() {
            return Err(Error::MigrationCommitting(partition_id));
        }
        active.cancel.cancel();
        tracing::warn!(
            node_id = self.node_id,
            migration_id = %active.status.migration_id,
            partition_id,
            state = %active.status.state,
            "Migration cancelled"
        );
        Ok(active.status.migration_id)
    }

    /// Stop accepting migrations and cancel every one not yet committing.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        tracing::info!(node_id = self.node_id, "Migration coordinator shut down");
    }

    /// Run one migration to a terminal state.
    ///
    /// Errors are returned only when the event is not admitted. Once admitted,
    /// the outcome (including rollback or failure) is in the report.
    #[tracing::instrument(
        skip(self, event),
        fields(
            node_id = %self.node_id,
            partition_id = event.partition_id,
            migration_type = %event.migration_type
        )
    )]
    pub async fn migrate(&self, event: MigrationServiceEvent) -> Result<MigrationReport> {
        let (mut record, cancel) = self.admit(event)?;
        self.metrics.record_start();

        tracing::info!(
            migration_id = %record.id,
            source = ?record.event.source,
            destination = record.event.destination,
            replica_index = record.event.replica_index,
            "Migration started"
        );

        let (failure, commit_failures) = self.run(&mut record, &cancel).await;
        Ok(self.finish(record, failure, commit_failures))
    }

    /// Run a batch of migrations.
    ///
    /// Events for the same partition run in the given order, one at a time.
    /// Different partitions run concurrently. Once an event does not commit,
    /// the remaining events of its partition are skipped. Reports come back
    /// in input order.
    pub async fn execute_plan(
        self: &Arc<Self>,
        events: Vec<MigrationServiceEvent>,
    ) -> Vec<MigrationReport> {
        let mut groups: BTreeMap<PartitionId, Vec<(usize, MigrationServiceEvent)>> =
            BTreeMap::new();
        for (index, event) in events.iter().cloned().enumerate() {
            groups.entry(event.partition_id).or_default().push((index, event));
        }

        tracing::info!(
            node_id = self.node_id,
            events = events.len(),
            partitions = groups.len(),
            "Executing migration plan"
        );

        let mut tasks = JoinSet::new();
        for (_, group) in groups {
            let coordinator = Arc::clone(self);
            tasks.spawn(async move { coordinator.run_partition_group(group).await });
        }

        let mut reports: Vec<Option<MigrationReport>> = vec![None; events.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(group_reports) => {
                    for (index, report) in group_reports {
                        reports[index] = Some(report);
                    }
                }
                Err(e) => {
                    tracing::error!(node_id = self.node_id, error = %e, "Migration plan task failed");
                }
            }
        }

        reports
            .into_iter()
            .zip(events)
            .map(|(report, event)| {
                report.unwrap_or_else(|| {
                    MigrationReport::not_started(
                        event,
                        MigrationFailure::Rejected {
                            reason: "plan task aborted".to_string(),
                        },
                    )
                })
            })
            .collect()
    }

    async fn run_partition_group(
        &self,
        group: Vec<(usize, MigrationServiceEvent)>,
    ) -> Vec<(usize, MigrationReport)> {
        let mut reports = Vec::with_capacity(group.len());
        let mut blocked_by: Option<String> = None;
        for (index, event) in group {
            if let Some(reason) = &blocked_by {
                reports.push((
                    index,
                    MigrationReport::not_started(
                        event,
                        MigrationFailure::Skipped {
                            reason: reason.clone(),
                        },
                    ),
                ));
                continue;
            }

            let report = match self.migrate(event.clone()).await {
                Ok(report) => report,
                Err(e) => MigrationReport::not_started(
                    event,
                    MigrationFailure::Rejected {
                        reason: e.to_string(),
                    },
                ),
            };
            if !report.is_committed() {
                blocked_by = Some(format!(
                    "earlier migration {} ended {}",
                    report.migration_id, report.state
                ));
            }
            reports.push((index, report));
        }
        reports
    }

    fn admit(&self, event: MigrationServiceEvent) -> Result<(MigrationRecord, CancellationToken)> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.is_paused() {
            return Err(Error::MigrationPaused);
        }
        let partition_id = event.partition_id;
        if event.source.unwrap_or(self.node_id) != self.node_id {
            return Err(Error::InvalidMigration {
                partition_id,
                reason: format!("node {} is not the source {:?}", self.node_id, event.source),
            });
        }
        match self.active.entry(partition_id) {
            Entry::Occupied(_) => Err(Error::PartitionMigrating(partition_id)),
            Entry::Vacant(vacant) => {
                // Flag taken here is released in `finish` or by the commit.
                self.table.try_begin_migration(&event)?;
                let record = MigrationRecord::new(event);
                let cancel = self.shutdown.child_token();
                vacant.insert(ActiveMigration {
                    status: MigrationStatus {
                        migration_id: record.id,
                        event: record.event.clone(),
                        state: record.state,
                        attempts: 0,
                        started_at: record.started_at,
                    },
                    cancel: cancel.clone(),
                });
                Ok((record, cancel))
            }
        }
    }

    /// Drive the record to a terminal state. Returns the failure, if any, and
    /// the services whose source-side commit kept failing.
    async fn run(
        &self,
        record: &mut MigrationRecord,
        cancel: &CancellationToken,
    ) -> (Option<MigrationFailure>, Vec<String>) {
        let _permits = match self.acquire_slots(record.event.destination, cancel).await {
            Some(permits) => permits,
            None => {
                self.set_state(record, MigrationState::RolledBack);
                return (Some(MigrationFailure::Cancelled), Vec::new());
            }
        };

        if let Err(failure) = self.prepare(record, cancel).await {
            return (Some(failure), Vec::new());
        }

        if !self.enter_committing(record) {
            self.rollback(record, self.registry.len()).await;
            self.set_state(record, MigrationState::RolledBack);
            return (Some(MigrationFailure::Cancelled), Vec::new());
        }

        if let Some(failure) = self.transfer(record).await {
            tracing::warn!(
                migration_id = %record.id,
                partition_id = record.partition_id(),
                failure = %failure,
                "Transfer failed, rolling back"
            );
            self.rollback(record, self.registry.len()).await;
            self.set_state(record, MigrationState::RolledBack);
            return (Some(failure), Vec::new());
        }

        self.commit(record).await
    }

    async fn acquire_slots(
        &self,
        destination: NodeId,
        cancel: &CancellationToken,
    ) -> Option<(OwnedSemaphorePermit, OwnedSemaphorePermit)> {
        let per_destination = Arc::clone(
            self.destination_slots
                .entry(destination)
                .or_insert_with(|| {
                    Arc::new(Semaphore::new(self.config.max_in_flight_per_destination))
                })
                .value(),
        );
        let global = Arc::clone(&self.global_slots);

        tokio::select! {
            _ = cancel.cancelled() => None,
            permits = async {
                // Queue on the destination first so a busy one holds no global slot.
                let destination = per_destination.acquire_owned().await.ok()?;
                let global = global.acquire_owned().await.ok()?;
                Some((destination, global))
            } => permits,
        }
    }

    /// Run `before_migration` and `prepare` for every participant in order.
    async fn prepare(
        &self,
        record: &mut MigrationRecord,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), MigrationFailure> {
        let partition_id = record.partition_id();
        self.set_state(record, MigrationState::Preparing);

        let participants: Vec<_> = self.registry.iter().cloned().collect();
        for (touched, participant) in participants.into_iter().enumerate() {
            if cancel.is_cancelled() {
                self.rollback(record, touched).await;
                self.set_state(record, MigrationState::RolledBack);
                return Err(MigrationFailure::Cancelled);
            }

            let service = participant.service_name().to_string();
            let event = record.event.clone();
            let result = self
                .executor
                .execute(partition_id, move |ctx| {
                    let service = participant.service_name();
                    guarded(service, || participant.before_migration(ctx, &event))?;
                    guarded(service, || participant.prepare_migration_operation(ctx, &event))
                })
                .await
                .and_then(|r| r);

            match result {
                Ok(Some(payload)) => record.payloads.push(ServicePayload::new(&service, payload)),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        migration_id = %record.id,
                        partition_id,
                        service = %service,
                        error = %e,
                        "Participant failed to prepare migration"
                    );
                    self.rollback(record, touched + 1).await;
                    self.set_state(record, MigrationState::Failed);
                    let reason = match e {
                        Error::Participant { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    return Err(MigrationFailure::Preparation { service, reason });
                }
            }
        }

        if cancel.is_cancelled() {
            self.rollback(record, self.registry.len()).await;
            self.set_state(record, MigrationState::RolledBack);
            return Err(MigrationFailure::Cancelled);
        }

        self.set_state(record, MigrationState::Prepared);
        tracing::debug!(
            migration_id = %record.id,
            partition_id,
            payloads = record.payloads.len(),
            "Migration prepared"
        );
        Ok(())
    }

    /// Move to `Committing` unless the migration was cancelled.
    ///
    /// Checked under the active entry's lock so a concurrent
    /// [`cancel_migration`](Self::cancel_migration) either wins or fails.
    fn enter_committing(&self, record: &mut MigrationRecord) -> bool {
        let Some(mut active) = self.active.get_mut(&record.partition_id()) else {
            return false;
        };
        if active.cancel.is_cancelled() {
            return false;
        }
        if let Err(e) = record.transition(MigrationState::Committing) {
            tracing::error!(migration_id = %record.id, error = %e, "Invalid migration state");
            return false;
        }
        active.status.state = MigrationState::Committing;
        true
    }

    /// Send the composite operation until it is acknowledged, refused, or
    /// out of attempts.
    async fn transfer(&self, record: &mut MigrationRecord) -> Option<MigrationFailure> {
        let destination = record.event.destination;
        let max_attempts = self.config.max_transfer_attempts;

        loop {
            record.attempts += 1;
            let attempt = record.attempts;
            if let Some(mut active) = self.active.get_mut(&record.partition_id()) {
                active.status.attempts = attempt;
            }

            let operation = MigrationOperation::new(
                record.id,
                record.event.clone(),
                attempt,
                record.payloads.clone(),
            );
            self.metrics.record_sent(operation.payload_bytes());

            let sent = self.transport.send_migration_operation(destination, operation);
            let outcome = match tokio::time::timeout(self.config.ack_timeout, sent).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    return Some(MigrationFailure::Transport {
                        reason: e.to_string(),
                    })
                }
                Err(_) => TransferOutcome::Timeout,
            };

            match outcome {
                TransferOutcome::Ack => return None,
                TransferOutcome::Nack(reason) => {
                    return Some(MigrationFailure::TransferRejected { reason })
                }
                TransferOutcome::Timeout if attempt >= max_attempts => {
                    return Some(MigrationFailure::TransferTimeout { attempts: attempt })
                }
                TransferOutcome::Timeout => {
                    let delay = self.backoff(attempt);
                    self.metrics.record_retry();
                    tracing::warn!(
                        migration_id = %record.id,
                        partition_id = record.partition_id(),
                        destination,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Migration transfer timed out, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_for(attempt);
        let jitter = self.config.backoff_jitter;
        if jitter <= 0.0 {
            return base;
        }
        let factor = 1.0 + rand::rng().random_range(-jitter..=jitter);
        base.mul_f64(factor)
    }

    /// Apply the table update and commit every participant in one partition task.
    async fn commit(&self, record: &mut MigrationRecord) -> (Option<MigrationFailure>, Vec<String>) {
        let partition_id = record.partition_id();
        let event = record.event.clone();
        let table = Arc::clone(&self.table);
        let registry = Arc::clone(&self.registry);

        let result = self
            .executor
            .execute(partition_id, move |ctx| {
                let previous = table.apply_event(&event)?;
                let failed: Vec<String> = registry
                    .iter()
                    .filter_map(|participant| {
                        let service = participant.service_name();
                        guarded(service, || participant.commit_migration(ctx, &event))
                            .err()
                            .map(|_| service.to_string())
                    })
                    .collect();
                Ok::<_, Error>((previous, failed))
            })
            .await
            .and_then(|r| r);

        let (previous, failed) = match result {
            Ok(done) => done,
            Err(e) => {
                // The destination holds the data but ownership cannot move.
                tracing::error!(
                    migration_id = %record.id,
                    partition_id,
                    error = %e,
                    "Partition table update failed after acknowledgment"
                );
                self.rollback(record, self.registry.len()).await;
                self.set_state(record, MigrationState::RolledBack);
                return (
                    Some(MigrationFailure::Rejected {
                        reason: e.to_string(),
                    }),
                    Vec::new(),
                );
            }
        };

        self.set_state(record, MigrationState::Committed);
        tracing::debug!(
            migration_id = %record.id,
            partition_id,
            previous_owner = ?previous.owner,
            previous_version = previous.version,
            "Partition table updated"
        );

        let mut commit_failures = Vec::new();
        for service in failed {
            if !self.retry_commit(record, &service).await {
                let err = Error::CommitFailure {
                    service: service.clone(),
                    partition_id,
                    reason: "source-side commit kept failing".to_string(),
                };
                self.metrics.record_commit_failure();
                tracing::error!(
                    migration_id = %record.id,
                    partition_id,
                    service = %service,
                    error = %err,
                    "Source cleanup failed after commit; operator attention required"
                );
                commit_failures.push(service);
            }
        }
        (None, commit_failures)
    }

    async fn retry_commit(&self, record: &MigrationRecord, service: &str) -> bool {
        let Some(participant) = self.registry.get(service).cloned() else {
            return false;
        };
        for attempt in 1..=self.config.commit_retry_attempts {
            tokio::time::sleep(self.config.backoff_for(attempt)).await;
            let participant = Arc::clone(&participant);
            let event = record.event.clone();
            let result = self
                .executor
                .execute(record.partition_id(), move |ctx| {
                    guarded(participant.service_name(), || {
                        participant.commit_migration(ctx, &event)
                    })
                })
                .await
                .and_then(|r| r);
            match result {
                Ok(()) => return true,
                Err(e) => tracing::warn!(
                    migration_id = %record.id,
                    service,
                    attempt,
                    error = %e,
                    "Commit retry failed"
                ),
            }
        }
        false
    }

    /// Roll back the first `touched` participants in reverse registration order.
    async fn rollback(&self, record: &MigrationRecord, touched: usize) {
        if touched == 0 {
            return;
        }
        let participants: Vec<Arc<dyn MigrationAwareService>> =
            self.registry.iter().take(touched).cloned().collect();
        let event = record.event.clone();
        let migration_id = record.id;
        let partition_id = record.partition_id();

        let result = self
            .executor
            .execute(partition_id, move |ctx| {
                for participant in participants.iter().rev() {
                    let service = participant.service_name();
                    if let Err(e) = guarded(service, || participant.rollback_migration(ctx, &event)) {
                        tracing::error!(
                            %migration_id,
                            partition_id,
                            service,
                            error = %e,
                            "Participant rollback failed"
                        );
                    }
                }
            })
            .await;
        if let Err(e) = result {
            tracing::error!(%migration_id, partition_id, error = %e, "Rollback task failed");
        }
    }

    fn set_state(&self, record: &mut MigrationRecord, next: MigrationState) {
        if let Err(e) = record.transition(next) {
            tracing::error!(migration_id = %record.id, error = %e, "Invalid migration state");
            return;
        }
        if let Some(mut active) = self.active.get_mut(&record.partition_id()) {
            active.status.state = next;
        }
    }

    fn finish(
        &self,
        record: MigrationRecord,
        failure: Option<MigrationFailure>,
        commit_failures: Vec<String>,
    ) -> MigrationReport {
        let partition_id = record.partition_id();
        // Admission flagged the partition; a commit already cleared it.
        if record.state != MigrationState::Committed {
            if let Err(e) = self.table.set_migrating(partition_id, false) {
                tracing::error!(migration_id = %record.id, error = %e, "Failed to clear partition flag");
            }
        }

        let report = record.report(failure, commit_failures);
        let cancelled = report.failure == Some(MigrationFailure::Cancelled);
        self.metrics
            .record_finish(report.state, cancelled, report.duration);
        self.active.remove(&partition_id);

        {
            let mut history = self.history.lock();
            history.push_back(report.clone());
            while history.len() > self.config.history_limit {
                history.pop_front();
            }
        }

        match &report.failure {
            None => tracing::info!(
                migration_id = %report.migration_id,
                partition_id,
                attempts = report.attempts,
                duration_ms = report.duration.as_millis() as u64,
                "Migration committed"
            ),
            Some(failure) => tracing::warn!(
                migration_id = %report.migration_id,
                partition_id,
                state = %report.state,
                attempts = report.attempts,
                failure = %failure,
                "Migration did not commit"
            ),
        }
        report
    }
}
