//! Primary election.
//!
//! With per-repository election every repository row carries its own
//! primary. Whenever the healthy set changes (and on a fixed interval) every
//! row whose primary is gone or unhealthy gets a new one: a healthy, assigned
//! storage on the highest known generation, ties broken at random. Rows with
//! no such storage are demoted to read-only by clearing the primary.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use crate::config::ConfiguredStorages;
use crate::datastore::{DatastoreError, RepositoryRecord, RepositoryStore};
use crate::health::{HealthChecker, HealthySet};
use crate::metrics::ProxyMetrics;
use crate::random::Rand;

#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    #[error("unknown virtual storage {0:?}")]
    UnknownVirtualStorage(String),
    #[error("repository {virtual_storage}/{relative_path} has no primary")]
    NoPrimary {
        virtual_storage: String,
        relative_path: String,
    },
    #[error(transparent)]
    Datastore(#[from] DatastoreError),
}

fn no_primary(virtual_storage: &str, relative_path: &str) -> ElectionError {
    ElectionError::NoPrimary {
        virtual_storage: virtual_storage.to_string(),
        relative_path: relative_path.to_string(),
    }
}

#[async_trait]
pub trait PrimaryGetter: Send + Sync {
    async fn primary(&self, virtual_storage: &str, relative_path: &str) -> Result<String, ElectionError>;
}

/// The configured default primary of each virtual storage, or its first node.
pub fn shard_primaries(
    storages: &ConfiguredStorages,
    default_primaries: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    storages
        .iter()
        .filter_map(|(virtual_storage, nodes)| {
            let primary = default_primaries
                .get(virtual_storage)
                .or_else(|| nodes.first())?;
            Some((virtual_storage.clone(), primary.clone()))
        })
        .collect()
}

/// Fixed primaries taken from configuration.
pub struct StaticElector {
    primaries: BTreeMap<String, String>,
}

impl StaticElector {
    pub fn new(storages: &ConfiguredStorages, default_primaries: &BTreeMap<String, String>) -> Self {
        Self {
            primaries: shard_primaries(storages, default_primaries),
        }
    }
}

#[async_trait]
impl PrimaryGetter for StaticElector {
    async fn primary(&self, virtual_storage: &str, _relative_path: &str) -> Result<String, ElectionError> {
        self.primaries
            .get(virtual_storage)
            .cloned()
            .ok_or_else(|| ElectionError::UnknownVirtualStorage(virtual_storage.to_string()))
    }
}

/// Outcome of one election pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ElectionSummary {
    pub elected: u64,
    pub demoted: u64,
}

pub struct PerRepositoryElector {
    storages: ConfiguredStorages,
    default_primaries: BTreeMap<String, String>,
    store: Arc<dyn RepositoryStore>,
    health: Arc<dyn HealthChecker>,
    rand: Arc<Rand>,
    metrics: Arc<ProxyMetrics>,
}

impl PerRepositoryElector {
    pub fn new(
        storages: ConfiguredStorages,
        default_primaries: BTreeMap<String, String>,
        store: Arc<dyn RepositoryStore>,
        health: Arc<dyn HealthChecker>,
        rand: Arc<Rand>,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        Self {
            storages,
            default_primaries,
            store,
            health,
            rand,
            metrics,
        }
    }

    /// Primary for a repository that has no row yet: the default primary when
    /// it is healthy, else any healthy assigned storage.
    async fn initial_primary(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<String, ElectionError> {
        let healthy = self.health.healthy();
        let assigned = self
            .store
            .host_assignments(virtual_storage, relative_path)
            .await?;

        if let Some(default) = self.default_primaries.get(virtual_storage) {
            if healthy.contains(virtual_storage, default) && assigned.contains(default) {
                return Ok(default.clone());
            }
        }

        let candidates: Vec<&String> = self
            .storages
            .get(virtual_storage)
            .into_iter()
            .flatten()
            .filter(|storage| assigned.contains(*storage) && healthy.contains(virtual_storage, storage))
            .collect();
        self.rand
            .pick(&candidates)
            .map(|storage| (*storage).clone())
            .ok_or_else(|| no_primary(virtual_storage, relative_path))
    }

    /// Candidate with the highest generation among healthy assigned
    /// storages, or None.
    fn candidate(&self, record: &RepositoryRecord, healthy: &HealthySet) -> Option<String> {
        let configured = self.storages.get(&record.virtual_storage)?;
        let eligible: Vec<(&String, i64)> = configured
            .iter()
            .filter(|storage| record.assigned.is_empty() || record.assigned.contains(*storage))
            .filter(|storage| healthy.contains(&record.virtual_storage, storage))
            .filter_map(|storage| record.replicas.get(storage).map(|g| (storage, *g)))
            .collect();
        let best = eligible.iter().map(|(_, generation)| *generation).max()?;
        let tied: Vec<&String> = eligible
            .iter()
            .filter(|(_, generation)| *generation == best)
            .map(|(storage, _)| *storage)
            .collect();
        self.rand.pick(&tied).map(|storage| (*storage).clone())
    }

    /// Re-elect the primary of every repository whose primary is missing or
    /// unhealthy.
    pub async fn elect_all(&self) -> Result<ElectionSummary, ElectionError> {
        let healthy = self.health.healthy();
        let mut summary = ElectionSummary::default();

        for virtual_storage in self.storages.keys() {
            for record in self.store.repositories(virtual_storage).await? {
                if let Some(primary) = &record.primary {
                    if healthy.contains(virtual_storage, primary) {
                        continue;
                    }
                }

                let candidate = self.candidate(&record, &healthy);
                if candidate.is_none() && record.primary.is_none() {
                    continue;
                }
                let swapped = self
                    .store
                    .set_primary(
                        virtual_storage,
                        &record.relative_path,
                        record.primary.as_deref(),
                        candidate.as_deref(),
                    )
                    .await?;
                if !swapped {
                    // Another instance got there first.
                    continue;
                }

                match &candidate {
                    Some(primary) => {
                        tracing::info!(
                            virtual_storage = %virtual_storage,
                            relative_path = %record.relative_path,
                            previous = ?record.primary,
                            primary = %primary,
                            "elected new primary"
                        );
                        summary.elected += 1;
                        self.metrics.record_primary_elected();
                    }
                    None => {
                        tracing::warn!(
                            virtual_storage = %virtual_storage,
                            relative_path = %record.relative_path,
                            previous = ?record.primary,
                            "no eligible primary, repository is read-only"
                        );
                        summary.demoted += 1;
                        self.metrics.record_primary_demoted();
                    }
                }
            }
        }
        Ok(summary)
    }

    /// Run elections on every healthy-set change and every `interval`.
    ///
    /// Elections after a health change hold the failover lock exclusively,
    /// so no call is routed against primaries that are being replaced.
    /// Periodic elections run without it; `set_primary` is a
    /// compare-and-set and routing never waits on them.
    pub fn spawn(
        self: Arc<Self>,
        mut healthy: watch::Receiver<Arc<HealthySet>>,
        interval: Duration,
        failover_lock: Arc<RwLock<()>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
            let mut health_open = true;
            loop {
                let failover = tokio::select! {
                    _ = ticker.tick() => false,
                    changed = healthy.changed(), if health_open => {
                        if changed.is_err() {
                            health_open = false;
                            continue;
                        }
                        true
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                };

                let result = if failover {
                    let _guard = failover_lock.write().await;
                    self.elect_all().await
                } else {
                    self.elect_all().await
                };
                if let Err(err) = result {
                    tracing::warn!(failover, error = ?err, "primary election failed");
                }
            }
        })
    }
}

#[async_trait]
impl PrimaryGetter for PerRepositoryElector {
    async fn primary(&self, virtual_storage: &str, relative_path: &str) -> Result<String, ElectionError> {
        if !self.storages.contains_key(virtual_storage) {
            return Err(ElectionError::UnknownVirtualStorage(virtual_storage.to_string()));
        }
        match self.store.repository(virtual_storage, relative_path).await? {
            Some(record) => record
                .primary
                .ok_or_else(|| no_primary(virtual_storage, relative_path)),
            None => self.initial_primary(virtual_storage, relative_path).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::datastore::MemoryRepositoryStore;

    struct FixedHealth(Mutex<Arc<HealthySet>>);

    impl FixedHealth {
        fn new(healthy: &[&str]) -> Arc<Self> {
            let health = Arc::new(Self(Mutex::new(Arc::default())));
            health.set(healthy);
            health
        }

        fn set(&self, healthy: &[&str]) {
            let mut set = HealthySet::default();
            for storage in healthy {
                set.insert("vs", storage);
            }
            *self.0.lock().unwrap() = Arc::new(set);
        }
    }

    impl HealthChecker for FixedHealth {
        fn healthy(&self) -> Arc<HealthySet> {
            self.0.lock().unwrap().clone()
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

    fn elector(
        store: Arc<MemoryRepositoryStore>,
        health: Arc<FixedHealth>,
        default_primary: Option<&str>,
    ) -> PerRepositoryElector {
        let defaults = default_primary
            .map(|p| [("vs".to_string(), p.to_string())].into_iter().collect())
            .unwrap_or_default();
        PerRepositoryElector::new(
            storages(),
            defaults,
            store,
            health,
            Arc::new(Rand::seeded(7)),
            Arc::new(ProxyMetrics::default()),
        )
    }

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn static_elector_uses_default_or_first() {
        let defaults = [("vs".to_string(), "n2".to_string())].into_iter().collect();
        let elector = StaticElector::new(&storages(), &defaults);
        assert_eq!(elector.primary("vs", "r").await.unwrap(), "n2");

        let elector = StaticElector::new(&storages(), &BTreeMap::new());
        assert_eq!(elector.primary("vs", "r").await.unwrap(), "n1");
        assert!(matches!(
            elector.primary("nope", "r").await,
            Err(ElectionError::UnknownVirtualStorage(_))
        ));
    }

    #[tokio::test]
    async fn new_repository_prefers_healthy_default() {
        let store = Arc::new(MemoryRepositoryStore::new(storages()));
        let health = FixedHealth::new(&["n1", "n2", "n3"]);
        let elector = elector(store.clone(), health.clone(), Some("n2"));
        assert_eq!(elector.primary("vs", "new").await.unwrap(), "n2");

        health.set(&["n3"]);
        assert_eq!(elector.primary("vs", "new").await.unwrap(), "n3");

        health.set(&[]);
        assert!(matches!(
            elector.primary("vs", "new").await,
            Err(ElectionError::NoPrimary { .. })
        ));
    }

    #[tokio::test]
    async fn stored_primary_is_returned() {
        let store = Arc::new(MemoryRepositoryStore::new(storages()));
        store.increment_generation("vs", "r", "n3", &[]).await.unwrap();
        let elector = elector(store.clone(), FixedHealth::new(&["n1"]), Some("n1"));
        assert_eq!(elector.primary("vs", "r").await.unwrap(), "n3");

        store.set_primary("vs", "r", Some("n3"), None).await.unwrap();
        assert!(matches!(
            elector.primary("vs", "r").await,
            Err(ElectionError::NoPrimary { .. })
        ));
    }

    #[tokio::test]
    async fn failover_picks_healthy_latest() {
        let store = Arc::new(MemoryRepositoryStore::new(storages()));
        store.increment_generation("vs", "r", "n1", &names(&["n2", "n3"])).await.unwrap();
        store.increment_generation("vs", "r", "n1", &names(&["n3"])).await.unwrap();
        let health = FixedHealth::new(&["n1", "n2", "n3"]);
        let elector = elector(store.clone(), health.clone(), None);

        assert_eq!(elector.elect_all().await.unwrap(), ElectionSummary::default());

        health.set(&["n2", "n3"]);
        let summary = elector.elect_all().await.unwrap();
        assert_eq!(summary.elected, 1);
        assert_eq!(elector.primary("vs", "r").await.unwrap(), "n3");
    }

    #[tokio::test]
    async fn tie_break_stays_within_latest() {
        let store = Arc::new(MemoryRepositoryStore::new(storages()));
        store.increment_generation("vs", "r", "n1", &names(&["n2", "n3"])).await.unwrap();
        let health = FixedHealth::new(&["n2", "n3"]);
        let elector = elector(store.clone(), health, None);
        elector.elect_all().await.unwrap();
        let primary = elector.primary("vs", "r").await.unwrap();
        assert!(primary == "n2" || primary == "n3");
    }

    #[tokio::test]
    async fn unassigned_storages_are_not_candidates() {
        let store = Arc::new(MemoryRepositoryStore::new(storages()));
        store.increment_generation("vs", "r", "n1", &names(&["n2", "n3"])).await.unwrap();
        store.set_assignments("vs", "r", &names(&["n1", "n2"])).await.unwrap();
        let elector = elector(store.clone(), FixedHealth::new(&["n3"]), None);

        let summary = elector.elect_all().await.unwrap();
        assert_eq!(summary, ElectionSummary { elected: 0, demoted: 1 });
        assert_eq!(store.repository("vs", "r").await.unwrap().unwrap().primary, None);

        // A demoted row stays demoted while nothing is eligible.
        assert_eq!(elector.elect_all().await.unwrap(), ElectionSummary::default());
    }

    #[tokio::test]
    async fn election_loop_reacts_to_health_changes() {
        let store = Arc::new(MemoryRepositoryStore::new(storages()));
        store.increment_generation("vs", "r", "n1", &names(&["n2"])).await.unwrap();
        let health = FixedHealth::new(&["n2"]);
        let elector = Arc::new(elector(store.clone(), health, None));

        let (health_tx, health_rx) = watch::channel(Arc::new(HealthySet::default()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = elector.clone().spawn(
            health_rx,
            Duration::from_secs(3600),
            Arc::new(RwLock::new(())),
            shutdown_rx,
        );
        health_tx.send(Arc::new(HealthySet::default())).unwrap();

        for _ in 0..50 {
            if elector.primary("vs", "r").await.unwrap() == "n2" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(elector.primary("vs", "r").await.unwrap(), "n2");

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn periodic_election_runs_while_calls_are_routed() {
        let store = Arc::new(MemoryRepositoryStore::new(storages()));
        store.increment_generation("vs", "r", "n1", &names(&["n2"])).await.unwrap();
        let elector = Arc::new(elector(store.clone(), FixedHealth::new(&["n2"]), None));

        let failover_lock = Arc::new(RwLock::new(()));
        let routing = failover_lock.clone().read_owned().await;
        let (_health_tx, health_rx) = watch::channel(Arc::new(HealthySet::default()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = elector.clone().spawn(
            health_rx,
            Duration::from_millis(100),
            failover_lock.clone(),
            shutdown_rx,
        );

        for _ in 0..50 {
            if elector.primary("vs", "r").await.unwrap() == "n2" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(elector.primary("vs", "r").await.unwrap(), "n2");
        assert!(failover_lock.try_read().is_ok());
        drop(routing);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
