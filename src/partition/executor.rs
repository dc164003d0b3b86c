//! Partition-affine task execution.
//!
//! Every partition is pinned to one worker thread (`partition_id % pool_size`)
//! and every worker drains a single FIFO queue. Tasks submitted for the same
//! partition therefore run one at a time, in submission order, without any
//! locking inside the tasks themselves.
//!
//! Tasks are synchronous segments. Work that has to wait on something remote
//! (a migration waiting for an acknowledgment) is written as an async caller
//! that submits one segment, awaits the network off the worker, and submits
//! the continuation. The continuation queues behind whatever was submitted for
//! the partition in the meantime, so workers never block on I/O.

use crate::config::ExecutorConfig;
use crate::error::{Error, Result};
use crate::types::PartitionId;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;
use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce(&PartitionContext) + Send>;

struct QueuedTask {
    partition_id: PartitionId,
    job: Job,
}

/// Capability handed to code running on a partition thread.
///
/// Only the executor can create one, so any function taking a
/// `&PartitionContext` is guaranteed to run on the thread owning that partition.
#[derive(Debug)]
pub struct PartitionContext {
    partition_id: PartitionId,
    worker: usize,
}

impl PartitionContext {
    pub(crate) fn new(partition_id: PartitionId, worker: usize) -> Self {
        Self {
            partition_id,
            worker,
        }
    }

    /// Partition this task runs for.
    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// Index of the worker thread running the task.
    pub fn worker(&self) -> usize {
        self.worker
    }
}

/// Handle to the result of a submitted task.
#[derive(Debug)]
pub struct PartitionTask<R> {
    partition_id: PartitionId,
    rx: oneshot::Receiver<R>,
}

impl<R> Future for PartitionTask<R> {
    type Output = Result<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let partition_id = self.partition_id;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.map_err(|_| Error::TaskAborted(partition_id)))
    }
}

#[derive(Debug, Default)]
struct WorkerStats {
    completed: AtomicU64,
    panicked: AtomicU64,
}

/// Fixed pool of partition worker threads.
pub struct PartitionExecutor {
    partition_count: u32,
    senders: RwLock<Vec<mpsc::UnboundedSender<QueuedTask>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    stats: Arc<WorkerStats>,
}

impl std::fmt::Debug for PartitionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionExecutor")
            .field("partition_count", &self.partition_count)
            .field("senders", &self.senders.read().len())
            .field("workers", &self.workers.lock().len())
            .finish()
    }
}

impl PartitionExecutor {
    /// Start `config.pool_size` workers serving `partition_count` partitions.
    pub fn new(config: &ExecutorConfig, partition_count: u32, name: &str) -> Result<Self> {
        if config.pool_size == 0 {
            return Err(Error::Config("executor pool_size must be positive".into()));
        }

        let stats = Arc::new(WorkerStats::default());
        let mut senders = Vec::with_capacity(config.pool_size);
        let mut workers = Vec::with_capacity(config.pool_size);
        for worker in 0..config.pool_size {
            let (tx, rx) = mpsc::unbounded_channel::<QueuedTask>();
            let stats = Arc::clone(&stats);
            let handle = thread::Builder::new()
                .name(format!("{}-partition-{}", name, worker))
                .spawn(move || worker_loop(worker, rx, &stats))
                .map_err(|e| Error::Internal(format!("failed to spawn partition worker: {}", e)))?;
            senders.push(tx);
            workers.push(handle);
        }

        tracing::debug!(
            pool_size = config.pool_size,
            partition_count,
            "Partition executor started"
        );

        Ok(Self {
            partition_count,
            senders: RwLock::new(senders),
            workers: Mutex::new(workers),
            stats,
        })
    }

    /// Number of worker threads.
    pub fn pool_size(&self) -> usize {
        self.workers.lock().len()
    }

    /// Worker index serving a partition.
    pub fn worker_for(&self, partition_id: PartitionId) -> usize {
        let pool = self.senders.read().len().max(1);
        partition_id as usize % pool
    }

    /// Enqueue `task` on the partition's worker.
    ///
    /// The task runs after every task previously submitted for the same
    /// partition. If it panics the returned future resolves to
    /// [`Error::TaskAborted`].
    pub fn submit<F, R>(&self, partition_id: PartitionId, task: F) -> Result<PartitionTask<R>>
    where
        F: FnOnce(&PartitionContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        if partition_id >= self.partition_count {
            return Err(Error::PartitionOutOfRange {
                partition_id,
                partition_count: self.partition_count,
            });
        }

        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |ctx| {
            let _ = tx.send(task(ctx));
        });

        let senders = self.senders.read();
        if senders.is_empty() {
            return Err(Error::ExecutorShutdown);
        }
        senders[partition_id as usize % senders.len()]
            .send(QueuedTask { partition_id, job })
            .map_err(|_| Error::ExecutorShutdown)?;

        Ok(PartitionTask { partition_id, rx })
    }

    /// Run `task` on the partition's worker and wait for its result.
    pub async fn execute<F, R>(&self, partition_id: PartitionId, task: F) -> Result<R>
    where
        F: FnOnce(&PartitionContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.submit(partition_id, task)?.await
    }

    /// Number of tasks that ran to completion.
    pub fn completed_tasks(&self) -> u64 {
        self.stats.completed.load(Ordering::Relaxed)
    }

    /// Number of tasks that panicked.
    pub fn panicked_tasks(&self) -> u64 {
        self.stats.panicked.load(Ordering::Relaxed)
    }

    /// Stop accepting tasks and wait for queued ones to drain.
    pub fn shutdown(&self) {
        // Closing the channels lets every worker finish its queue and exit.
        self.senders.write().clear();

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("Partition worker exited abnormally");
            }
        }
    }
}

impl Drop for PartitionExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    worker: usize,
    mut rx: mpsc::UnboundedReceiver<QueuedTask>,
    stats: &WorkerStats,
) {
    while let Some(task) = rx.blocking_recv() {
        let ctx = PartitionContext::new(task.partition_id, worker);
        let job = task.job;
        match catch_unwind(AssertUnwindSafe(move || job(&ctx))) {
            Ok(()) => {
                stats.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                stats.panicked.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    worker,
                    partition_id = task.partition_id,
                    "Partition task panicked"
                );
            }
        }
    }
    tracing::trace!(worker, "Partition worker stopped");
}
