//! Cluster-wide node health.
//!
//! Every instance probes every configured storage, records the result in the
//! shared [`HealthStatusStore`] and adopts the set of storages a majority of
//! active instances can reach. The set is published through a `watch`
//! channel so routing reads a consistent snapshot and the elector can react
//! to changes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tonic::Status;

use crate::config::ConfiguredStorages;
use crate::datastore::{DatastoreError, HealthReport, HealthStatusStore};
use crate::metrics::ProxyMetrics;

/// Healthy storages grouped by virtual storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthySet {
    storages: BTreeMap<String, BTreeSet<String>>,
}

impl HealthySet {
    /// Every configured storage.
    pub fn all(storages: &ConfiguredStorages) -> Self {
        let mut set = Self::default();
        for (virtual_storage, nodes) in storages {
            for storage in nodes {
                set.insert(virtual_storage, storage);
            }
        }
        set
    }

    pub fn insert(&mut self, virtual_storage: &str, storage: &str) {
        self.storages
            .entry(virtual_storage.to_string())
            .or_default()
            .insert(storage.to_string());
    }

    pub fn contains(&self, virtual_storage: &str, storage: &str) -> bool {
        self.storages
            .get(virtual_storage)
            .map(|storages| storages.contains(storage))
            .unwrap_or(false)
    }

    pub fn storages(&self, virtual_storage: &str) -> Vec<String> {
        self.storages
            .get(virtual_storage)
            .map(|storages| storages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, virtual_storage: &str) -> usize {
        self.storages.get(virtual_storage).map(BTreeSet::len).unwrap_or(0)
    }
}

/// Snapshot of the storages currently considered healthy.
pub trait HealthChecker: Send + Sync {
    fn healthy(&self) -> Arc<HealthySet>;
}

/// Checks a single storage. Implemented over gRPC by the node set.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, virtual_storage: &str, storage: &str) -> Result<bool, Status>;
}

/// Reports every configured storage as healthy. Used when failover is off.
pub struct StaticHealthChecker {
    healthy: Arc<HealthySet>,
}

impl StaticHealthChecker {
    pub fn new(storages: &ConfiguredStorages) -> Self {
        Self {
            healthy: Arc::new(HealthySet::all(storages)),
        }
    }
}

impl HealthChecker for StaticHealthChecker {
    fn healthy(&self) -> Arc<HealthySet> {
        self.healthy.clone()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct HealthManagerConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub participant_timeout: Duration,
    pub healthiness_timeout: Duration,
}

pub struct HealthManager {
    instance: String,
    storages: ConfiguredStorages,
    prober: Arc<dyn Prober>,
    store: Arc<dyn HealthStatusStore>,
    metrics: Arc<ProxyMetrics>,
    cfg: HealthManagerConfig,
    healthy: watch::Sender<Arc<HealthySet>>,
}

impl HealthManager {
    pub fn new(
        instance: impl Into<String>,
        storages: ConfiguredStorages,
        prober: Arc<dyn Prober>,
        store: Arc<dyn HealthStatusStore>,
        metrics: Arc<ProxyMetrics>,
        cfg: HealthManagerConfig,
    ) -> Self {
        let (healthy, _) = watch::channel(Arc::new(HealthySet::default()));
        Self {
            instance: instance.into(),
            storages,
            prober,
            store,
            metrics,
            cfg,
            healthy,
        }
    }

    /// Receives every distinct healthy set once published.
    pub fn subscribe(&self) -> watch::Receiver<Arc<HealthySet>> {
        self.healthy.subscribe()
    }

    async fn probe_all(&self) -> Vec<HealthReport> {
        let probes = self.storages.iter().flat_map(|(virtual_storage, storages)| {
            storages.iter().map(move |storage| async move {
                let healthy = match tokio::time::timeout(
                    self.cfg.probe_timeout,
                    self.prober.probe(virtual_storage, storage),
                )
                .await
                {
                    Ok(Ok(serving)) => serving,
                    Ok(Err(status)) => {
                        tracing::warn!(
                            virtual_storage = %virtual_storage,
                            storage = %storage,
                            error = %status,
                            "health probe failed"
                        );
                        false
                    }
                    Err(_) => {
                        tracing::warn!(
                            virtual_storage = %virtual_storage,
                            storage = %storage,
                            timeout_ms = self.cfg.probe_timeout.as_millis() as u64,
                            "health probe timed out"
                        );
                        false
                    }
                };
                if !healthy {
                    self.metrics.record_health_probe_failure();
                }
                HealthReport {
                    virtual_storage: virtual_storage.clone(),
                    storage: storage.clone(),
                    healthy,
                }
            })
        });
        futures_util::future::join_all(probes).await
    }

    /// Run one probe and report cycle and publish the result.
    pub async fn check_once(&self) -> Result<Arc<HealthySet>, DatastoreError> {
        let reports = self.probe_all().await;
        let set = self
            .store
            .report_health(
                &self.instance,
                &reports,
                Utc::now(),
                self.cfg.participant_timeout,
                self.cfg.healthiness_timeout,
            )
            .await?;

        self.healthy.send_if_modified(|current| {
            if **current == set {
                return false;
            }
            tracing::info!(healthy = ?set, "healthy storages changed");
            *current = Arc::new(set);
            true
        });
        Ok(self.healthy.borrow().clone())
    }

    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(self.cfg.interval.max(Duration::from_millis(100)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.check_once().await {
                            tracing::warn!(error = ?err, "health check cycle failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

impl HealthChecker for HealthManager {
    fn healthy(&self) -> Arc<HealthySet> {
        self.healthy.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::datastore::MemoryHealthStore;

    #[derive(Default)]
    struct FakeProber {
        down: Mutex<HashMap<String, bool>>,
        slow: Mutex<HashMap<String, bool>>,
    }

    impl FakeProber {
        fn set_down(&self, storage: &str, down: bool) {
            self.down.lock().unwrap().insert(storage.to_string(), down);
        }
    }

    #[async_trait]
    impl Prober for FakeProber {
        async fn probe(&self, _virtual_storage: &str, storage: &str) -> Result<bool, Status> {
            let slow = self.slow.lock().unwrap().get(storage).copied().unwrap_or(false);
            if slow {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.down.lock().unwrap().get(storage).copied().unwrap_or(false) {
                return Err(Status::unavailable("connection refused"));
            }
            Ok(true)
        }
    }

    fn storages() -> ConfiguredStorages {
        [(
            "vs".to_string(),
            vec!["n1".to_string(), "n2".to_string(), "n3".to_string()],
        )]
        .into_iter()
        .collect()
    }

    fn manager(prober: Arc<FakeProber>, metrics: Arc<ProxyMetrics>) -> HealthManager {
        HealthManager::new(
            "p1",
            storages(),
            prober,
            Arc::new(MemoryHealthStore::new()),
            metrics,
            HealthManagerConfig {
                interval: Duration::from_millis(100),
                probe_timeout: Duration::from_millis(50),
                participant_timeout: Duration::from_secs(60),
                healthiness_timeout: Duration::from_millis(0),
            },
        )
    }

    #[test]
    fn healthy_set_queries() {
        let set = HealthySet::all(&storages());
        assert!(set.contains("vs", "n2"));
        assert!(!set.contains("vs", "n4"));
        assert!(!set.contains("other", "n1"));
        assert_eq!(set.count("vs"), 3);
        assert_eq!(set.storages("vs"), vec!["n1", "n2", "n3"]);
        assert!(set.storages("other").is_empty());
    }

    #[test]
    fn static_checker_reports_everything() {
        let checker = StaticHealthChecker::new(&storages());
        assert_eq!(checker.healthy().count("vs"), 3);
    }

    #[tokio::test]
    async fn publishes_changes_only() {
        let prober = Arc::new(FakeProber::default());
        let metrics = Arc::new(ProxyMetrics::default());
        let manager = manager(prober.clone(), metrics.clone());
        let mut rx = manager.subscribe();
        assert_eq!(manager.healthy().count("vs"), 0);

        let set = manager.check_once().await.unwrap();
        assert_eq!(set.count("vs"), 3);
        assert!(rx.has_changed().unwrap());
        let _ = rx.borrow_and_update();

        manager.check_once().await.unwrap();
        assert!(!rx.has_changed().unwrap());

        prober.set_down("n1", true);
        let set = manager.check_once().await.unwrap();
        assert!(!set.contains("vs", "n1"));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().storages("vs"), vec!["n2", "n3"]);
        assert_eq!(metrics.snapshot().health_probe_failures, 1);
    }

    #[tokio::test]
    async fn slow_probe_counts_as_unhealthy() {
        let prober = Arc::new(FakeProber::default());
        prober.slow.lock().unwrap().insert("n2".to_string(), true);
        let manager = manager(prober, Arc::new(ProxyMetrics::default()));
        let set = manager.check_once().await.unwrap();
        assert_eq!(set.storages("vs"), vec!["n1", "n3"]);
    }

    #[tokio::test]
    async fn loop_stops_on_shutdown() {
        let manager = Arc::new(manager(
            Arc::new(FakeProber::default()),
            Arc::new(ProxyMetrics::default()),
        ));
        let (tx, rx) = watch::channel(false);
        let mut healthy = manager.subscribe();
        let handle = manager.clone().spawn(rx);
        healthy.changed().await.unwrap();
        assert_eq!(manager.healthy().count("vs"), 3);
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
