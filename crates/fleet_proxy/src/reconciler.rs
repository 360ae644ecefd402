//! Periodic repair of lagging replicas.
//!
//! Each pass walks the repository records and enqueues an `update` for every
//! healthy assigned replica that is behind the latest generation, copying
//! from a random healthy replica that is on it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ConfiguredStorages;
use crate::datastore::{
    ChangeType, DatastoreError, EventMeta, ReplicationEventQueue, ReplicationJob, RepositoryStore,
};
use crate::health::HealthChecker;
use crate::metrics::ProxyMetrics;
use crate::random::Rand;

pub struct Reconciler {
    storages: ConfiguredStorages,
    store: Arc<dyn RepositoryStore>,
    queue: Arc<dyn ReplicationEventQueue>,
    health: Arc<dyn HealthChecker>,
    rand: Arc<Rand>,
    metrics: Arc<ProxyMetrics>,
}

impl Reconciler {
    pub fn new(
        storages: ConfiguredStorages,
        store: Arc<dyn RepositoryStore>,
        queue: Arc<dyn ReplicationEventQueue>,
        health: Arc<dyn HealthChecker>,
        rand: Arc<Rand>,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        Self {
            storages,
            store,
            queue,
            health,
            rand,
            metrics,
        }
    }

    /// One reconciliation pass. Returns the jobs that were enqueued.
    pub async fn reconcile_once(&self) -> Result<Vec<ReplicationJob>, DatastoreError> {
        let healthy = self.health.healthy();
        let mut scheduled = Vec::new();

        for (virtual_storage, configured) in &self.storages {
            if healthy.count(virtual_storage) < 2 {
                tracing::debug!(
                    virtual_storage = %virtual_storage,
                    "fewer than two healthy storages, skipping reconciliation"
                );
                continue;
            }

            for record in self.store.repositories(virtual_storage).await? {
                if record.primary.is_none() {
                    continue;
                }
                let assigned: Vec<&String> = configured
                    .iter()
                    .filter(|storage| record.assigned.is_empty() || record.assigned.contains(*storage))
                    .filter(|storage| healthy.contains(virtual_storage, storage))
                    .collect();

                let sources: Vec<&String> = assigned
                    .iter()
                    .copied()
                    .filter(|storage| record.replicas.get(*storage) == Some(&record.generation))
                    .collect();
                let Some(source) = self.rand.pick(&sources) else {
                    continue;
                };

                for target in assigned {
                    let behind = record.replicas.get(target).copied().unwrap_or(-1) < record.generation;
                    if !behind {
                        continue;
                    }
                    if self
                        .queue
                        .has_pending_update(virtual_storage, &record.relative_path, target)
                        .await?
                    {
                        continue;
                    }

                    let job = ReplicationJob::new(
                        ChangeType::Update,
                        virtual_storage.as_str(),
                        record.relative_path.as_str(),
                        source.as_str(),
                        target.as_str(),
                    );
                    self.queue.enqueue(job.clone(), EventMeta::default()).await?;
                    tracing::info!(
                        virtual_storage = %virtual_storage,
                        relative_path = %record.relative_path,
                        source = %source,
                        target = %target,
                        generation = record.generation,
                        "scheduled reconciliation update"
                    );
                    scheduled.push(job);
                }
            }
        }

        if !scheduled.is_empty() {
            self.metrics.record_reconciler_jobs(scheduled.len() as u64);
        }
        Ok(scheduled)
    }

    pub fn spawn(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.reconcile_once().await {
                            tracing::warn!(error = ?err, "reconciliation failed");
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    use crate::datastore::{JobState, MemoryDatastore, RepositoryRecord};
    use crate::health::{HealthySet, StaticHealthChecker};

    fn storages() -> ConfiguredStorages {
        [(
            "vs".to_string(),
            vec!["n1".to_string(), "n2".to_string(), "n3".to_string()],
        )]
        .into_iter()
        .collect()
    }

    fn record(relative_path: &str, replicas: &[(&str, i64)]) -> RepositoryRecord {
        let replicas: BTreeMap<String, i64> = replicas
            .iter()
            .map(|(storage, generation)| (storage.to_string(), *generation))
            .collect();
        RepositoryRecord {
            virtual_storage: "vs".to_string(),
            relative_path: relative_path.to_string(),
            generation: replicas.values().copied().max().unwrap_or(0),
            primary: Some("n1".to_string()),
            replicas,
            assigned: BTreeSet::new(),
        }
    }

    struct FixedHealth(Arc<HealthySet>);

    impl HealthChecker for FixedHealth {
        fn healthy(&self) -> Arc<HealthySet> {
            self.0.clone()
        }
    }

    fn reconciler(data: &MemoryDatastore, health: Arc<dyn HealthChecker>) -> Reconciler {
        Reconciler::new(
            storages(),
            data.repositories.clone(),
            data.queue.clone(),
            health,
            Arc::new(Rand::seeded(3)),
            Arc::new(ProxyMetrics::default()),
        )
    }

    #[tokio::test]
    async fn schedules_update_for_lagging_replica() {
        let data = MemoryDatastore::new(storages(), 3);
        data.repositories
            .insert(record("lagging", &[("n1", 10), ("n2", 10), ("n3", 8)]));
        data.repositories
            .insert(record("in-sync", &[("n1", 4), ("n2", 4), ("n3", 4)]));
        let reconciler = reconciler(&data, Arc::new(StaticHealthChecker::new(&storages())));

        let jobs = reconciler.reconcile_once().await.unwrap();
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.change, ChangeType::Update);
        assert_eq!(job.relative_path, "lagging");
        assert_eq!(job.target_node_storage, "n3");
        assert!(["n1", "n2"].contains(&job.source_node_storage.as_str()));

        let events = data.queue.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state, JobState::Ready);

        // Already pending: nothing new.
        assert!(reconciler.reconcile_once().await.unwrap().is_empty());
        assert_eq!(data.queue.events().len(), 1);
    }

    #[tokio::test]
    async fn missing_replica_is_scheduled() {
        let data = MemoryDatastore::new(storages(), 3);
        data.repositories.insert(record("new", &[("n1", 2), ("n2", 2)]));
        let reconciler = reconciler(&data, Arc::new(StaticHealthChecker::new(&storages())));

        let jobs = reconciler.reconcile_once().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].target_node_storage, "n3");
    }

    #[tokio::test]
    async fn unhealthy_targets_and_unassigned_storages_are_skipped() {
        let data = MemoryDatastore::new(storages(), 3);
        data.repositories
            .insert(record("r1", &[("n1", 5), ("n2", 3), ("n3", 3)]));
        let mut assigned = record("r2", &[("n1", 5), ("n2", 5), ("n3", 1)]);
        assigned.assigned = ["n1".to_string(), "n2".to_string()].into_iter().collect();
        data.repositories.insert(assigned);

        let mut healthy = HealthySet::default();
        healthy.insert("vs", "n1");
        healthy.insert("vs", "n2");
        let reconciler = reconciler(&data, Arc::new(FixedHealth(Arc::new(healthy))));

        let jobs = reconciler.reconcile_once().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].relative_path, "r1");
        assert_eq!(jobs[0].source_node_storage, "n1");
        assert_eq!(jobs[0].target_node_storage, "n2");
    }

    #[tokio::test]
    async fn needs_two_healthy_storages() {
        let data = MemoryDatastore::new(storages(), 3);
        data.repositories
            .insert(record("r", &[("n1", 5), ("n2", 3), ("n3", 3)]));
        let mut healthy = HealthySet::default();
        healthy.insert("vs", "n1");
        let reconciler = reconciler(&data, Arc::new(FixedHealth(Arc::new(healthy))));

        assert!(reconciler.reconcile_once().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_only_repositories_are_left_alone() {
        let data = MemoryDatastore::new(storages(), 3);
        let mut orphan = record("r", &[("n1", 5), ("n2", 3)]);
        orphan.primary = None;
        data.repositories.insert(orphan);
        let reconciler = reconciler(&data, Arc::new(StaticHealthChecker::new(&storages())));

        assert!(reconciler.reconcile_once().await.unwrap().is_empty());
    }
}
