//! In-process counters for proxying, voting, replication and failover.
//!
//! Counters are lock-free so they can be bumped on the RPC hot path. A
//! background task periodically logs a snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::protoregistry::OpType;

#[derive(Debug, Default)]
pub struct ProxyMetrics {
    /// Proxied accessor RPCs.
    rpc_accessor: AtomicU64,
    /// Proxied mutator RPCs.
    rpc_mutator: AtomicU64,
    /// Proxied maintenance RPCs.
    rpc_maintenance: AtomicU64,
    /// RPCs answered by the proxy itself.
    rpc_local: AtomicU64,
    /// Routing decisions that failed.
    router_errors: AtomicU64,
    tx_registered: AtomicU64,
    tx_committed: AtomicU64,
    tx_aborted: AtomicU64,
    tx_cancelled: AtomicU64,
    replication_completed: AtomicU64,
    replication_failed: AtomicU64,
    replication_dead: AtomicU64,
    replication_scheduled: AtomicU64,
    health_probe_failures: AtomicU64,
    reconciler_jobs_scheduled: AtomicU64,
    primaries_elected: AtomicU64,
    primaries_demoted: AtomicU64,
    /// Finalizer steps that failed after the RPC itself succeeded.
    finalizer_errors: AtomicU64,
}

/// Point-in-time copy of [`ProxyMetrics`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProxyMetricsSnapshot {
    pub rpc_accessor: u64,
    pub rpc_mutator: u64,
    pub rpc_maintenance: u64,
    pub rpc_local: u64,
    pub router_errors: u64,
    pub tx_registered: u64,
    pub tx_committed: u64,
    pub tx_aborted: u64,
    pub tx_cancelled: u64,
    pub replication_completed: u64,
    pub replication_failed: u64,
    pub replication_dead: u64,
    pub replication_scheduled: u64,
    pub health_probe_failures: u64,
    pub reconciler_jobs_scheduled: u64,
    pub primaries_elected: u64,
    pub primaries_demoted: u64,
    pub finalizer_errors: u64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl ProxyMetrics {
    pub fn record_rpc(&self, operation: OpType) {
        match operation {
            OpType::Accessor => bump(&self.rpc_accessor, 1),
            OpType::Mutator => bump(&self.rpc_mutator, 1),
            OpType::Maintenance => bump(&self.rpc_maintenance, 1),
            OpType::Unknown => {}
        }
    }

    pub fn record_local_rpc(&self) {
        bump(&self.rpc_local, 1);
    }

    pub fn record_router_error(&self) {
        bump(&self.router_errors, 1);
    }

    pub fn record_transaction_registered(&self) {
        bump(&self.tx_registered, 1);
    }

    /// Records the final outcome of a transaction's primary.
    pub fn record_transaction_outcome(&self, committed: bool, cancelled: bool) {
        if cancelled {
            bump(&self.tx_cancelled, 1);
        } else if committed {
            bump(&self.tx_committed, 1);
        } else {
            bump(&self.tx_aborted, 1);
        }
    }

    pub fn record_replication_completed(&self) {
        bump(&self.replication_completed, 1);
    }

    pub fn record_replication_failed(&self) {
        bump(&self.replication_failed, 1);
    }

    pub fn record_replication_dead(&self) {
        bump(&self.replication_dead, 1);
    }

    pub fn record_replication_scheduled(&self, jobs: u64) {
        bump(&self.replication_scheduled, jobs);
    }

    pub fn record_health_probe_failure(&self) {
        bump(&self.health_probe_failures, 1);
    }

    pub fn record_reconciler_jobs(&self, jobs: u64) {
        bump(&self.reconciler_jobs_scheduled, jobs);
    }

    pub fn record_primary_elected(&self) {
        bump(&self.primaries_elected, 1);
    }

    pub fn record_primary_demoted(&self) {
        bump(&self.primaries_demoted, 1);
    }

    pub fn record_finalizer_error(&self) {
        bump(&self.finalizer_errors, 1);
    }

    pub fn snapshot(&self) -> ProxyMetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ProxyMetricsSnapshot {
            rpc_accessor: load(&self.rpc_accessor),
            rpc_mutator: load(&self.rpc_mutator),
            rpc_maintenance: load(&self.rpc_maintenance),
            rpc_local: load(&self.rpc_local),
            router_errors: load(&self.router_errors),
            tx_registered: load(&self.tx_registered),
            tx_committed: load(&self.tx_committed),
            tx_aborted: load(&self.tx_aborted),
            tx_cancelled: load(&self.tx_cancelled),
            replication_completed: load(&self.replication_completed),
            replication_failed: load(&self.replication_failed),
            replication_dead: load(&self.replication_dead),
            replication_scheduled: load(&self.replication_scheduled),
            health_probe_failures: load(&self.health_probe_failures),
            reconciler_jobs_scheduled: load(&self.reconciler_jobs_scheduled),
            primaries_elected: load(&self.primaries_elected),
            primaries_demoted: load(&self.primaries_demoted),
            finalizer_errors: load(&self.finalizer_errors),
        }
    }
}

/// Log a metrics snapshot every `interval` until shutdown is signalled.
pub fn spawn_metrics_logger(
    metrics: Arc<ProxyMetrics>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let s = metrics.snapshot();
                    tracing::info!(
                        rpc_accessor = s.rpc_accessor,
                        rpc_mutator = s.rpc_mutator,
                        rpc_maintenance = s.rpc_maintenance,
                        rpc_local = s.rpc_local,
                        router_errors = s.router_errors,
                        tx_registered = s.tx_registered,
                        tx_committed = s.tx_committed,
                        tx_aborted = s.tx_aborted,
                        tx_cancelled = s.tx_cancelled,
                        replication_completed = s.replication_completed,
                        replication_failed = s.replication_failed,
                        replication_dead = s.replication_dead,
                        replication_scheduled = s.replication_scheduled,
                        health_probe_failures = s.health_probe_failures,
                        reconciler_jobs_scheduled = s.reconciler_jobs_scheduled,
                        primaries_elected = s.primaries_elected,
                        primaries_demoted = s.primaries_demoted,
                        finalizer_errors = s.finalizer_errors,
                        "proxy metrics"
                    );
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let metrics = ProxyMetrics::default();
        metrics.record_rpc(OpType::Mutator);
        metrics.record_rpc(OpType::Mutator);
        metrics.record_rpc(OpType::Accessor);
        metrics.record_transaction_outcome(true, false);
        metrics.record_transaction_outcome(false, true);
        metrics.record_replication_scheduled(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.rpc_mutator, 2);
        assert_eq!(snapshot.rpc_accessor, 1);
        assert_eq!(snapshot.tx_committed, 1);
        assert_eq!(snapshot.tx_cancelled, 1);
        assert_eq!(snapshot.tx_aborted, 0);
        assert_eq!(snapshot.replication_scheduled, 3);
    }
}
