//! Participant that records every callback.

use crate::error::{Error, Result};
use crate::migration::{MigrationAwareService, MigrationPayload};
use crate::partition::PartitionContext;
use crate::types::{MigrationServiceEvent, PartitionId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Participant callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Before,
    Prepare,
    Commit,
    Rollback,
    Apply,
    Discard,
}

/// One recorded callback.
#[derive(Debug, Clone)]
pub struct Call {
    pub phase: Phase,
    pub partition_id: PartitionId,
    /// Name of the thread the callback ran on.
    pub thread: Option<String>,
}

/// Test participant with scriptable failures.
#[derive(Debug)]
pub struct RecordingParticipant {
    name: String,
    payload: Mutex<Option<Vec<u8>>>,
    calls: Mutex<Vec<Call>>,
    fail_before: AtomicBool,
    fail_prepare: AtomicBool,
    fail_apply: AtomicBool,
    panic_prepare: AtomicBool,
    /// Time `prepare` blocks the partition worker.
    prepare_delay: Mutex<Option<Duration>>,
    /// Number of commit calls still to fail.
    commit_failures: AtomicU32,
}

impl RecordingParticipant {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            payload: Mutex::new(Some(name.as_bytes().to_vec())),
            calls: Mutex::new(Vec::new()),
            fail_before: AtomicBool::new(false),
            fail_prepare: AtomicBool::new(false),
            fail_apply: AtomicBool::new(false),
            panic_prepare: AtomicBool::new(false),
            prepare_delay: Mutex::new(None),
            commit_failures: AtomicU32::new(0),
        })
    }

    /// Make `prepare` return nothing to transfer.
    pub fn without_payload(self: Arc<Self>) -> Arc<Self> {
        *self.payload.lock() = None;
        self
    }

    pub fn fail_before(&self) {
        self.fail_before.store(true, Ordering::SeqCst);
    }

    pub fn fail_prepare(&self) {
        self.fail_prepare.store(true, Ordering::SeqCst);
    }

    pub fn panic_in_prepare(&self) {
        self.panic_prepare.store(true, Ordering::SeqCst);
    }

    /// Block the partition worker for `delay` in every `prepare` call.
    pub fn delay_prepare(&self, delay: Duration) {
        *self.prepare_delay.lock() = Some(delay);
    }

    pub fn fail_apply(&self) {
        self.fail_apply.store(true, Ordering::SeqCst);
    }

    /// Fail the next `count` commit calls.
    pub fn fail_commits(&self, count: u32) {
        self.commit_failures.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.calls.lock().iter().map(|c| c.phase).collect()
    }

    pub fn count(&self, phase: Phase) -> usize {
        self.calls.lock().iter().filter(|c| c.phase == phase).count()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, ctx: &PartitionContext, phase: Phase) {
        self.calls.lock().push(Call {
            phase,
            partition_id: ctx.partition_id(),
            thread: std::thread::current().name().map(str::to_string),
        });
    }
}

impl MigrationAwareService for RecordingParticipant {
    fn service_name(&self) -> &str {
        &self.name
    }

    fn before_migration(&self, ctx: &PartitionContext, _event: &MigrationServiceEvent) -> Result<()> {
        self.record(ctx, Phase::Before);
        if self.fail_before.load(Ordering::SeqCst) {
            return Err(Error::participant(&self.name, "before failed"));
        }
        Ok(())
    }

    fn prepare_migration_operation(
        &self,
        ctx: &PartitionContext,
        _event: &MigrationServiceEvent,
    ) -> Result<Option<MigrationPayload>> {
        self.record(ctx, Phase::Prepare);
        let delay = *self.prepare_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.panic_prepare.load(Ordering::SeqCst) {
            panic!("{} panicked in prepare", self.name);
        }
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(Error::participant(&self.name, "snapshot corrupted"));
        }
        Ok(self.payload.lock().clone().map(MigrationPayload::new))
    }

    fn commit_migration(&self, ctx: &PartitionContext, _event: &MigrationServiceEvent) -> Result<()> {
        self.record(ctx, Phase::Commit);
        let failing = self
            .commit_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::participant(&self.name, "commit failed"));
        }
        Ok(())
    }

    fn rollback_migration(&self, ctx: &PartitionContext, _event: &MigrationServiceEvent) -> Result<()> {
        self.record(ctx, Phase::Rollback);
        Ok(())
    }

    fn apply_migration(
        &self,
        ctx: &PartitionContext,
        _event: &MigrationServiceEvent,
        _payload: &MigrationPayload,
    ) -> Result<()> {
        self.record(ctx, Phase::Apply);
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(Error::participant(&self.name, "out of capacity"));
        }
        Ok(())
    }

    fn discard_migration(&self, ctx: &PartitionContext, _event: &MigrationServiceEvent) -> Result<()> {
        self.record(ctx, Phase::Discard);
        Ok(())
    }
}
