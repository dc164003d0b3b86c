//! Coordinator tests over a loopback cluster.

#[cfg(test)]
mod tests {
    use crate::error::{Error, Result};
    use crate::migration::{MigrationCoordinator, MigrationFailure, MigrationReport, MigrationState};
    use crate::testing::{
        fast_migration_config, init_tracing, Fault, Phase, TestCluster,
    };
    use crate::types::MigrationServiceEvent;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    const P: u32 = 5;

    async fn wait_for_state(
        coordinator: &MigrationCoordinator,
        partition_id: u32,
        state: MigrationState,
    ) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while coordinator.migration_state(partition_id) != Some(state) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }

    fn spawn_migration(
        coordinator: &Arc<MigrationCoordinator>,
        event: MigrationServiceEvent,
    ) -> JoinHandle<Result<MigrationReport>> {
        let coordinator = Arc::clone(coordinator);
        tokio::spawn(async move { coordinator.migrate(event).await })
    }

    fn cluster() -> TestCluster {
        init_tracing();
        let cluster = TestCluster::with_config(&[1, 2, 3], 2, fast_migration_config()).unwrap();
        cluster.table().assign(P, 1, vec![2]).unwrap();
        cluster
    }

    #[tokio::test]
    async fn test_copy_commits_and_transfers_data() {
        let cluster = cluster();
        let source = cluster.node(1).unwrap();
        let destination = cluster.node(3).unwrap();
        source.put(P, "k1", "v1").await.unwrap();
        source.put(P, "k2", "v2").await.unwrap();
        let version = cluster.table().version();

        let report = source
            .node
            .migrate(MigrationServiceEvent::copy_backup(P, 2, 1, 3))
            .await
            .unwrap();
        assert!(report.is_committed(), "{:?}", report.failure);

        let entry = cluster.table().get(P).unwrap();
        assert_eq!(entry.owner, Some(1));
        assert_eq!(entry.replicas, vec![2, 3]);
        assert!(!entry.migrating);
        assert_eq!(cluster.table().version(), version + 1);

        // Copy leaves the source serving writes.
        assert_eq!(destination.get(P, "k1").await.unwrap().as_deref(), Some("v1"));
        assert_eq!(source.get(P, "k2").await.unwrap().as_deref(), Some("v2"));
        source.put(P, "k3", "v3").await.unwrap();
        assert_eq!(report.attempts, 1);
        assert_eq!(report.state, MigrationState::Committed);
    }

    #[tokio::test]
    async fn test_participant_phases_run_in_order() {
        let cluster = cluster();
        let source = cluster.node(1).unwrap();
        let destination = cluster.node(2).unwrap();

        let report = source
            .node
            .migrate(MigrationServiceEvent::move_owner(P, 1, 2))
            .await
            .unwrap();
        assert!(report.is_committed());

        assert_eq!(
            source.recorder.phases(),
            vec![Phase::Before, Phase::Prepare, Phase::Commit]
        );
        assert_eq!(destination.recorder.phases(), vec![Phase::Apply]);

        // Every callback ran on the partition's worker thread.
        let worker = source.node.executor().worker_for(P);
        for call in source.recorder.calls() {
            assert_eq!(call.partition_id, P);
            assert_eq!(
                call.thread.as_deref(),
                Some(format!("node-1-partition-{}", worker).as_str())
            );
        }
    }

    #[tokio::test]
    async fn test_prepare_failure_fails_and_rolls_back_touched_participants() {
        let cluster = cluster();
        let source = cluster.node(1).unwrap();
        source.put(P, "k", "v").await.unwrap();
        source.recorder.fail_prepare();
        let before = cluster.table().get(P).unwrap();

        let report = source
            .node
            .migrate(MigrationServiceEvent::move_owner(P, 1, 2))
            .await
            .unwrap();

        assert_eq!(report.state, MigrationState::Failed);
        assert!(matches!(
            report.failure,
            Some(MigrationFailure::Preparation { ref service, .. }) if service == "recorder"
        ));
        assert_eq!(source.recorder.count(Phase::Rollback), 1);
        assert_eq!(cluster.table().get(P).unwrap(), before);
        assert!(!source.map.is_frozen(P));
        assert!(cluster.network().sent_to(2).is_empty());
        source.put(P, "k", "v2").await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_participant_is_a_preparation_failure() {
        let cluster = cluster();
        let source = cluster.node(1).unwrap();
        source.recorder.panic_in_prepare();

        let report = source
            .node
            .migrate(MigrationServiceEvent::move_owner(P, 1, 2))
            .await
            .unwrap();

        assert_eq!(report.state, MigrationState::Failed);
        assert_eq!(source.recorder.count(Phase::Rollback), 1);
        assert_eq!(cluster.table().owner_of(P), Some(1));
    }

    #[tokio::test]
    async fn test_earlier_participants_roll_back_when_a_later_one_fails_before() {
        let cluster = cluster();
        let source = cluster.node(1).unwrap();
        source.put(P, "k", "v").await.unwrap();
        source.recorder.fail_before();

        let report = source
            .node
            .migrate(MigrationServiceEvent::move_owner(P, 1, 2))
            .await
            .unwrap();

        assert_eq!(report.state, MigrationState::Failed);
        assert_eq!(source.recorder.phases(), vec![Phase::Before, Phase::Rollback]);
        assert!(!source.map.is_frozen(P));
    }

    #[tokio::test]
    async fn test_nack_rolls_back_without_retry() {
        let cluster = cluster();
        let source = cluster.node(1).unwrap();
        cluster
            .network()
            .set_fault(2, Fault::Nack("disk full".to_string()));

        let report = source
            .node
            .migrate(MigrationServiceEvent::move_owner(P, 1, 2))
            .await
            .unwrap();

        assert_eq!(report.state, MigrationState::RolledBack);
        assert_eq!(
            report.failure,
            Some(MigrationFailure::TransferRejected {
                reason: "disk full".to_string()
            })
        );
        assert_eq!(report.attempts, 1);
        assert_eq!(source.recorder.count(Phase::Rollback), 1);
        assert_eq!(cluster.table().owner_of(P), Some(1));
        assert!(!cluster.table().is_migrating(P));
    }

    #[tokio::test]
    async fn test_destination_apply_failure_discards_and_rolls_back() {
        let cluster = cluster();
        let source = cluster.node(1).unwrap();
        let destination = cluster.node(2).unwrap();
        source.put(P, "k", "v").await.unwrap();
        destination.recorder.fail_apply();

        let report = source
            .node
            .migrate(MigrationServiceEvent::move_owner(P, 1, 2))
            .await
            .unwrap();

        assert_eq!(report.state, MigrationState::RolledBack);
        assert!(matches!(
            report.failure,
            Some(MigrationFailure::TransferRejected { .. })
        ));
        // The map payload was applied before the recorder failed.
        assert_eq!(destination.get(P, "k").await.unwrap(), None);
        assert_eq!(source.get(P, "k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(cluster.table().owner_of(P), Some(1));
    }

    #[tokio::test]
    async fn test_timeout_then_ack_reuses_migration_id() {
        let cluster = cluster();
        let source = cluster.node(1).unwrap();
        cluster.network().set_fault_times(2, Fault::Timeout, 2);

        let report = source
            .node
            .migrate(MigrationServiceEvent::move_owner(P, 1, 2))
            .await
            .unwrap();

        assert!(report.is_committed());
        assert_eq!(report.attempts, 3);
        let sent = cluster.network().sent_to(2);
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|op| op.migration_id == report.migration_id));
        assert_eq!(
            sent.iter().map(|op| op.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(source.node.metrics().snapshot().transfer_retries, 2);
    }

    #[tokio::test]
    async fn test_lost_ack_is_deduplicated_on_retry() {
        let cluster = cluster();
        let source = cluster.node(1).unwrap();
        let destination = cluster.node(2).unwrap();
        source.put(P, "k", "v").await.unwrap();
        cluster.network().set_fault_times(2, Fault::DropResponse, 1);

        let report = source
            .node
            .migrate(MigrationServiceEvent::move_owner(P, 1, 2))
            .await
            .unwrap();

        assert!(report.is_committed());
        assert_eq!(report.attempts, 2);
        assert_eq!(destination.recorder.count(Phase::Apply), 1);
        assert!(destination.node.receiver().has_handled(&report.migration_id));
        assert_eq!(destination.node.metrics().snapshot().duplicates, 1);
        assert_eq!(destination.get(P, "k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_applies_once() {
        let cluster = cluster();
        let source = cluster.node(1).unwrap();
        let destination = cluster.node(2).unwrap();
        cluster.network().set_fault(2, Fault::Duplicate);

        let report = source
            .node
            .migrate(MigrationServiceEvent::move_owner(P, 1, 2))
            .await
            .unwrap();

        assert!(report.is_committed());
        assert_eq!(destination.recorder.count(Phase::Apply), 1);
    }

    #[tokio::test]
    async fn test_unreachable_destination_rolls_back() {
        let cluster = cluster();
        let source = cluster.node(1).unwrap();
        cluster.network().set_fault(2, Fault::Unreachable);

        let report = source
            .node
            .migrate(MigrationServiceEvent::move_owner(P, 1, 2))
            .await
            .unwrap();

        assert_eq!(report.state, MigrationState::RolledBack);
        assert!(matches!(
            report.failure,
            Some(MigrationFailure::Transport { .. })
        ));
        assert_eq!(source.recorder.count(Phase::Rollback), 1);
    }

    #[tokio::test]
    async fn test_slow_destination_times_out_per_attempt() {
        init_tracing();
        let config = fast_migration_config()
            .with_ack_timeout(Duration::from_millis(20))
            .with_max_transfer_attempts(2);
        let cluster = TestCluster::with_config(&[1, 2], 1, config).unwrap();
        cluster.table().assign(P, 1, vec![]).unwrap();
        cluster
            .network()
            .set_fault(2, Fault::Delay(Duration::from_millis(200)));

        let report = cluster
            .node(1)
            .unwrap()
            .node
            .migrate(MigrationServiceEvent::move_owner(P, 1, 2))
            .await
            .unwrap();

        assert_eq!(report.state, MigrationState::RolledBack);
        assert_eq!(
            report.failure,
            Some(MigrationFailure::TransferTimeout { attempts: 2 })
        );
        assert_eq!(cluster.table().owner_of(P), Some(1));
    }

    #[tokio::test]
    async fn test_commit_failure_is_retried() {
        let cluster = cluster();
        let source = cluster.node(1).unwrap();
        source.recorder.fail_commits(1);

        let report = source
            .node
            .migrate(MigrationServiceEvent::move_owner(P, 1, 2))
            .await
            .unwrap();

        assert!(report.is_committed());
        assert!(report.commit_failures.is_empty());
        assert_eq!(source.recorder.count(Phase::Commit), 2);
        assert_eq!(source.recorder.count(Phase::Rollback), 0);
    }

    #[tokio::test]
    async fn test_commit_failure_never_rolls_back_ownership() {
        let cluster = cluster();
        let source = cluster.node(1).unwrap();
        source.recorder.fail_commits(10);

        let report = source
            .node
            .migrate(MigrationServiceEvent::move_owner(P, 1, 2))
            .await
            .unwrap();

        assert_eq!(report.state, MigrationState::Committed);
        assert_eq!(report.commit_failures, vec!["recorder".to_string()]);
        assert_eq!(cluster.table().owner_of(P), Some(2));
        // First commit plus two retries.
        assert_eq!(source.recorder.count(Phase::Commit), 3);
        assert_eq!(source.recorder.count(Phase::Rollback), 0);
        assert_eq!(source.node.metrics().snapshot().commit_failures, 1);
    }

    #[tokio::test]
    async fn test_second_migration_for_busy_partition_is_refused() {
        let cluster = cluster();
        let source = cluster.node(1).unwrap();
        cluster
            .network()
            .set_fault(2, Fault::Delay(Duration::from_millis(100)));

        let coordinator = Arc::clone(source.node.coordinator());
        let first = tokio::spawn(async move {
            coordinator
                .migrate(MigrationServiceEvent::move_owner(P, 1, 2))
                .await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(source.node.coordinator().is_migrating(P));
        let err = source
            .node
            .migrate(MigrationServiceEvent::copy_backup(P, 1, 1, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PartitionMigrating(p) if p == P));

        assert!(first.await.unwrap().unwrap().is_committed());
        assert!(!source.node.coordinator().is_migrating(P));
    }

    #[tokio::test]
    async fn test_invalid_events_are_not_admitted() {
        let cluster = cluster();
        let source = cluster.node(1).unwrap();

        // Node 1 is not the source.
        let err = source
            .node
            .migrate(MigrationServiceEvent::move_owner(P, 2, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidMigration { .. }));

        // Node 2 already holds a replica.
        let err = source
            .node
            .migrate(MigrationServiceEvent::copy_backup(P, 1, 1, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidMigration { .. }));

        let err = source
            .node
            .migrate(MigrationServiceEvent::move_owner(99, 1, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PartitionOutOfRange { .. }));

        assert!(source.recorder.phases().is_empty());
        assert_eq!(source.node.metrics().snapshot().started, 0);
    }

    #[tokio::test]
    async fn test_paused_coordinator_refuses_new_migrations() {
        let cluster = cluster();
        let source = cluster.node(1).unwrap();
        let coordinator = source.node.coordinator();

        coordinator.pause();
        let err = source
            .node
            .migrate(MigrationServiceEvent::move_owner(P, 1, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MigrationPaused));
        assert!(coordinator.stats().paused);

        coordinator.resume();
        assert!(source
            .node
            .migrate(MigrationServiceEvent::move_owner(P, 1, 2))
            .await
            .unwrap()
            .is_committed());
    }

    #[tokio::test]
    async fn test_cancel_before_commit_rolls_back() {
        let cluster = cluster();
        let source = cluster.node(1).unwrap();
        let coordinator = Arc::clone(source.node.coordinator());

        // Hold the partition worker so the migration waits in Preparing.
        let (release, gate) = std::sync::mpsc::channel::<()>();
        let blocker = source
            .node
            .executor()
            .submit(P, move |_| {
                let _ = gate.recv_timeout(Duration::from_secs(5));
            })
            .unwrap();

        let running = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .migrate(MigrationServiceEvent::move_owner(P, 1, 2))
                    .await
            })
        };
        while coordinator.migration_state(P) != Some(MigrationState::Preparing) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let id = coordinator.cancel_migration(P).unwrap();
        release.send(()).unwrap();
        blocker.await.unwrap();

        let report = running.await.unwrap().unwrap();
        assert_eq!(report.migration_id, id);
        assert_eq!(report.state, MigrationState::RolledBack);
        assert_eq!(report.failure, Some(MigrationFailure::Cancelled));
        // Only the map had prepared when the cancellation was seen.
        assert!(source.recorder.phases().is_empty());
        assert!(!source.map.is_frozen(P));
        assert_eq!(cluster.table().owner_of(P), Some(1));
        assert!(!cluster.table().is_migrating(P));
        assert!(cluster.network().sent_to(2).is_empty());
        assert_eq!(coordinator.metrics().snapshot().cancelled, 1);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_a_slot_runs_no_callbacks() {
        init_tracing();
        let config = fast_migration_config().with_max_in_flight_per_destination(1);
        let cluster = TestCluster::with_config(&[1, 2], 1, config).unwrap();
        cluster.table().assign(P, 1, vec![]).unwrap();
        cluster.table().assign(6, 1, vec![]).unwrap();
        cluster
            .network()
            .set_fault(2, Fault::Delay(Duration::from_millis(200)));
        let source = cluster.node(1).unwrap();
        let coordinator = source.node.coordinator();
        let before = cluster.table().get(P).unwrap();

        // Partition 6 holds the only slot towards node 2.
        let holder = spawn_migration(coordinator, MigrationServiceEvent::move_owner(6, 1, 2));
        wait_for_state(coordinator, 6, MigrationState::Committing).await;
        let waiting = spawn_migration(coordinator, MigrationServiceEvent::move_owner(P, 1, 2));
        wait_for_state(coordinator, P, MigrationState::Pending).await;
        assert!(cluster.table().is_migrating(P));

        let id = coordinator.cancel_migration(P).unwrap();
        let report = waiting.await.unwrap().unwrap();
        assert_eq!(report.migration_id, id);
        assert_eq!(report.state, MigrationState::RolledBack);
        assert_eq!(report.failure, Some(MigrationFailure::Cancelled));
        assert_eq!(report.attempts, 0);

        assert!(source
            .recorder
            .calls()
            .iter()
            .all(|call| call.partition_id != P));
        assert!(!source.map.is_frozen(P));
        assert!(!cluster.table().is_migrating(P));
        assert_eq!(cluster.table().get(P).unwrap(), before);
        assert!(cluster
            .network()
            .sent_to(2)
            .iter()
            .all(|op| op.partition_id() != P));

        assert!(holder.await.unwrap().unwrap().is_committed());
        assert!(!cluster.table().is_migrating(6));
    }

    #[tokio::test]
    async fn test_cancel_after_every_participant_prepared_rolls_back_all() {
        let cluster = cluster();
        let source = cluster.node(1).unwrap();
        source.put(P, "k", "v").await.unwrap();
        source.recorder.delay_prepare(Duration::from_millis(100));
        let coordinator = source.node.coordinator();
        let before = cluster.table().get(P).unwrap();

        let running = spawn_migration(coordinator, MigrationServiceEvent::move_owner(P, 1, 2));
        // The recorder prepares last; once it started, the others are prepared.
        tokio::time::timeout(Duration::from_secs(5), async {
            while source.recorder.count(Phase::Prepare) == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        assert!(source.map.is_frozen(P));

        coordinator.cancel_migration(P).unwrap();
        let report = running.await.unwrap().unwrap();

        assert_eq!(report.state, MigrationState::RolledBack);
        assert_eq!(report.failure, Some(MigrationFailure::Cancelled));
        assert_eq!(
            source.recorder.phases(),
            vec![Phase::Before, Phase::Prepare, Phase::Rollback]
        );
        assert!(!source.map.is_frozen(P));
        assert!(!cluster.table().is_migrating(P));
        assert_eq!(cluster.table().get(P).unwrap(), before);
        assert!(cluster.network().sent_to(2).is_empty());
        source.put(P, "k", "v2").await.unwrap();
    }

    #[tokio::test]
    async fn test_partition_migrating_elsewhere_is_refused() {
        init_tracing();
        let config = fast_migration_config().with_max_concurrent_migrations(1);
        let cluster = TestCluster::with_config(&[1, 2, 3], 2, config).unwrap();
        cluster.table().assign(P, 1, vec![2]).unwrap();
        cluster.table().assign(6, 1, vec![]).unwrap();
        cluster
            .network()
            .set_fault(2, Fault::Delay(Duration::from_millis(200)));
        let owner = cluster.node(1).unwrap();
        let backup = cluster.node(2).unwrap();
        let coordinator = owner.node.coordinator();

        // Partition 6 holds node 1's only slot, so the move of P waits.
        let holder = spawn_migration(coordinator, MigrationServiceEvent::move_owner(6, 1, 2));
        wait_for_state(coordinator, 6, MigrationState::Committing).await;
        let waiting = spawn_migration(coordinator, MigrationServiceEvent::move_owner(P, 1, 3));
        wait_for_state(coordinator, P, MigrationState::Pending).await;
        assert!(cluster.table().is_migrating(P));

        let err = backup
            .node
            .migrate(MigrationServiceEvent::shrink_backup(P, 1, 2, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PartitionMigrating(p) if p == P));
        assert!(backup
            .recorder
            .calls()
            .iter()
            .all(|call| call.partition_id != P));

        assert!(holder.await.unwrap().unwrap().is_committed());
        assert!(waiting.await.unwrap().unwrap().is_committed());
        let entry = cluster.table().get(P).unwrap();
        assert_eq!(entry.owner, Some(3));
        assert_eq!(entry.replicas, vec![2]);
        assert_eq!(entry.version, 2);
        assert!(!entry.migrating);
    }

    #[tokio::test]
    async fn test_cancel_after_committing_is_refused() {
        let cluster = cluster();
        let source = cluster.node(1).unwrap();
        let coordinator = Arc::clone(source.node.coordinator());
        cluster
            .network()
            .set_fault(2, Fault::Delay(Duration::from_millis(100)));

        let running = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .migrate(MigrationServiceEvent::move_owner(P, 1, 2))
                    .await
            })
        };
        while coordinator.migration_state(P) != Some(MigrationState::Committing) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert!(matches!(
            coordinator.cancel_migration(P),
            Err(Error::MigrationCommitting(p)) if p == P
        ));
        assert!(running.await.unwrap().unwrap().is_committed());
        assert!(matches!(
            coordinator.cancel_migration(P),
            Err(Error::MigrationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_per_destination_cap_limits_in_flight_migrations() {
        init_tracing();
        let config = fast_migration_config().with_max_in_flight_per_destination(1);
        let cluster = TestCluster::with_config(&[1, 2], 1, config).unwrap();
        for p in 0..3 {
            cluster.table().assign(p, 1, vec![]).unwrap();
        }
        cluster
            .network()
            .set_fault(2, Fault::Delay(Duration::from_millis(40)));
        let coordinator = Arc::clone(cluster.node(1).unwrap().node.coordinator());

        let mut handles = Vec::new();
        for p in 0..3 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .migrate(MigrationServiceEvent::move_owner(p, 1, 2))
                    .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        let committing = coordinator
            .active_migrations()
            .iter()
            .filter(|m| m.state != MigrationState::Pending)
            .count();
        assert_eq!(committing, 1);
        assert_eq!(coordinator.available_slots(2), 0);

        for handle in handles {
            assert!(handle.await.unwrap().unwrap().is_committed());
        }
        assert_eq!(coordinator.available_slots(2), 1);
        assert_eq!(cluster.table().partitions_owned_by(2), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_idle_destination_is_not_starved_by_a_busy_one() {
        init_tracing();
        let config = fast_migration_config()
            .with_max_concurrent_migrations(2)
            .with_max_in_flight_per_destination(1);
        let cluster = TestCluster::with_config(&[1, 2, 3], 1, config).unwrap();
        for p in 0..3 {
            cluster.table().assign(p, 1, vec![]).unwrap();
        }
        cluster
            .network()
            .set_fault(2, Fault::Delay(Duration::from_millis(300)));
        let source = cluster.node(1).unwrap();
        let coordinator = source.node.coordinator();

        let first = spawn_migration(coordinator, MigrationServiceEvent::move_owner(0, 1, 2));
        wait_for_state(coordinator, 0, MigrationState::Committing).await;
        let queued = spawn_migration(coordinator, MigrationServiceEvent::move_owner(1, 1, 2));
        wait_for_state(coordinator, 1, MigrationState::Pending).await;

        let report = tokio::time::timeout(
            Duration::from_millis(150),
            source.node.migrate(MigrationServiceEvent::move_owner(2, 1, 3)),
        )
        .await
        .expect("migration to the idle destination waited on the busy one")
        .unwrap();
        assert!(report.is_committed());
        assert_eq!(coordinator.migration_state(1), Some(MigrationState::Pending));

        assert!(first.await.unwrap().unwrap().is_committed());
        assert!(queued.await.unwrap().unwrap().is_committed());
        assert_eq!(cluster.table().partitions_owned_by(2), vec![0, 1]);
        assert_eq!(cluster.table().owner_of(2), Some(3));
    }

    #[tokio::test]
    async fn test_history_and_metrics() {
        let cluster = cluster();
        let source = cluster.node(1).unwrap();
        let coordinator = source.node.coordinator();

        source
            .node
            .migrate(MigrationServiceEvent::copy_backup(P, 2, 1, 3))
            .await
            .unwrap();
        cluster.network().set_fault(2, Fault::Nack("busy".into()));
        source
            .node
            .migrate(MigrationServiceEvent::move_owner(P, 1, 2))
            .await
            .unwrap();

        let history = coordinator.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].state, MigrationState::Committed);
        assert_eq!(history[1].state, MigrationState::RolledBack);

        let stats = coordinator.stats();
        assert_eq!(stats.started, 2);
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.rolled_back, 1);
        assert_eq!(stats.active, 0);
        assert!(coordinator.metrics().snapshot().bytes_sent > 0);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_migrations() {
        let cluster = cluster();
        let source = cluster.node(1).unwrap();
        source.node.coordinator().shutdown();

        let err = source
            .node
            .migrate(MigrationServiceEvent::move_owner(P, 1, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
