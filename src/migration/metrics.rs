//! Metrics for migration observability.

use crate::metrics::{Counter, Gauge, Histogram, MIGRATION_LATENCY_BUCKETS};
use crate::migration::record::MigrationState;
use std::time::Duration;

/// Metrics for migration operations on one node.
#[derive(Debug)]
pub struct MigrationMetrics {
    /// Migrations currently in flight on this node.
    pub active: Gauge,
    /// Total migrations started.
    pub started: Counter,
    /// Total migrations committed.
    pub committed: Counter,
    /// Total migrations rolled back.
    pub rolled_back: Counter,
    /// Total migrations failed during preparation.
    pub failed: Counter,
    /// Total migrations cancelled before transfer.
    pub cancelled: Counter,
    /// Transfer attempts that timed out and were retried.
    pub transfer_retries: Counter,
    /// Source-side commits that kept failing.
    pub commit_failures: Counter,
    /// Payload bytes sent to destinations.
    pub bytes_sent: Counter,
    /// Redelivered operations answered from the receiver's cache.
    pub duplicates: Counter,
    /// Whether migrations are paused.
    pub paused: Gauge,
    /// Duration of terminal migrations (seconds).
    pub duration: Histogram,
}

impl MigrationMetrics {
    pub fn new() -> Self {
        Self {
            active: Gauge::new("migrations_active", "Number of active migrations"),
            started: Counter::new("migrations_started", "Total migrations started"),
            committed: Counter::new("migrations_committed", "Total migrations committed"),
            rolled_back: Counter::new("migrations_rolled_back", "Total migrations rolled back"),
            failed: Counter::new("migrations_failed", "Total migrations failed"),
            cancelled: Counter::new("migrations_cancelled", "Total migrations cancelled"),
            transfer_retries: Counter::new(
                "migration_transfer_retries",
                "Transfer attempts retried after a timeout",
            ),
            commit_failures: Counter::new(
                "migration_commit_failures",
                "Source-side commits that failed after acknowledgment",
            ),
            bytes_sent: Counter::new("migration_bytes_sent", "Payload bytes sent"),
            duplicates: Counter::new(
                "migration_duplicates",
                "Duplicate migration deliveries received",
            ),
            paused: Gauge::new("migrations_paused", "Whether migrations are paused"),
            duration: Histogram::with_buckets(
                "migration_duration",
                "Migration duration in seconds",
                MIGRATION_LATENCY_BUCKETS,
            ),
        }
    }

    /// Record a migration start.
    pub fn record_start(&self) {
        self.started.inc();
        self.active.inc();
    }

    /// Record a terminal migration.
    pub fn record_finish(&self, state: MigrationState, cancelled: bool, duration: Duration) {
        self.active.dec();
        self.duration.observe_duration(duration);
        match state {
            MigrationState::Committed => self.committed.inc(),
            MigrationState::RolledBack => self.rolled_back.inc(),
            _ => self.failed.inc(),
        }
        if cancelled {
            self.cancelled.inc();
        }
    }

    pub fn record_retry(&self) {
        self.transfer_retries.inc();
    }

    pub fn record_commit_failure(&self) {
        self.commit_failures.inc();
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.inc_by(bytes as u64);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.inc();
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.set(i64::from(paused));
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        macro_rules! add_metric {
            ($metric:expr, $kind:literal) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $metric.name(),
                    $metric.help(),
                    $metric.name(),
                    $kind,
                    $metric.name(),
                    $metric.get()
                ));
            };
        }

        add_metric!(self.started, "counter");
        add_metric!(self.committed, "counter");
        add_metric!(self.rolled_back, "counter");
        add_metric!(self.failed, "counter");
        add_metric!(self.cancelled, "counter");
        add_metric!(self.transfer_retries, "counter");
        add_metric!(self.commit_failures, "counter");
        add_metric!(self.bytes_sent, "counter");
        add_metric!(self.duplicates, "counter");
        add_metric!(self.active, "gauge");
        add_metric!(self.paused, "gauge");

        let name = self.duration.name();
        output.push_str(&format!(
            "# HELP {} {}\n# TYPE {} histogram\n",
            name,
            self.duration.help(),
            name
        ));
        for (bound, count) in self.duration.buckets() {
            output.push_str(&format!("{}_bucket{{le=\"{}\"}} {}\n", name, bound, count));
        }
        output.push_str(&format!(
            "{}_bucket{{le=\"+Inf\"}} {}\n{}_sum {}\n{}_count {}\n",
            name,
            self.duration.count(),
            name,
            self.duration.sum(),
            name,
            self.duration.count()
        ));
        output
    }

    /// Get a snapshot of migration metrics.
    pub fn snapshot(&self) -> MigrationMetricsSnapshot {
        MigrationMetricsSnapshot {
            active: self.active.get().max(0) as u64,
            started: self.started.get(),
            committed: self.committed.get(),
            rolled_back: self.rolled_back.get(),
            failed: self.failed.get(),
            cancelled: self.cancelled.get(),
            transfer_retries: self.transfer_retries.get(),
            commit_failures: self.commit_failures.get(),
            bytes_sent: self.bytes_sent.get(),
            duplicates: self.duplicates.get(),
            paused: self.paused.get() != 0,
        }
    }
}

impl Default for MigrationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of migration metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationMetricsSnapshot {
    pub active: u64,
    pub started: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub transfer_retries: u64,
    pub commit_failures: u64,
    pub bytes_sent: u64,
    pub duplicates: u64,
    pub paused: bool,
}

impl MigrationMetricsSnapshot {
    /// Get success rate as percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.committed + self.rolled_back + self.failed;
        if total == 0 {
            return 100.0;
        }
        (self.committed as f64 / total as f64) * 100.0
    }
}
