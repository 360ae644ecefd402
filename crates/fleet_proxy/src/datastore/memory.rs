//! In-memory stores for single-instance deployments and tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    cutoff, AssignmentGetter, Datastore, DatastoreError, EventMeta, Generation, HealthReport,
    HealthStatusStore, JobState, ReplicationEvent, ReplicationEventQueue, ReplicationJob,
    RepositoryRecord, RepositoryStore,
};
use crate::config::ConfiguredStorages;
use crate::health::HealthySet;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type RepoKey = (String, String);

fn key(virtual_storage: &str, relative_path: &str) -> RepoKey {
    (virtual_storage.to_string(), relative_path.to_string())
}

#[derive(Debug)]
pub struct MemoryRepositoryStore {
    storages: ConfiguredStorages,
    repositories: Mutex<BTreeMap<RepoKey, RepositoryRecord>>,
}

impl MemoryRepositoryStore {
    pub fn new(storages: ConfiguredStorages) -> Self {
        Self {
            storages,
            repositories: Mutex::new(BTreeMap::new()),
        }
    }

    /// Seed a repository record directly.
    pub fn insert(&self, record: RepositoryRecord) {
        lock(&self.repositories).insert(
            key(&record.virtual_storage, &record.relative_path),
            record,
        );
    }

    fn configured(&self, virtual_storage: &str) -> BTreeSet<String> {
        self.storages
            .get(virtual_storage)
            .map(|storages| storages.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn assignments_of(&self, record: Option<&RepositoryRecord>, virtual_storage: &str) -> BTreeSet<String> {
        match record {
            Some(record) if !record.assigned.is_empty() => record.assigned.clone(),
            _ => self.configured(virtual_storage),
        }
    }
}

#[async_trait]
impl AssignmentGetter for MemoryRepositoryStore {
    async fn host_assignments(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<BTreeSet<String>, DatastoreError> {
        let repositories = lock(&self.repositories);
        Ok(self.assignments_of(repositories.get(&key(virtual_storage, relative_path)), virtual_storage))
    }
}

#[async_trait]
impl RepositoryStore for MemoryRepositoryStore {
    async fn generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<Option<Generation>, DatastoreError> {
        Ok(lock(&self.repositories)
            .get(&key(virtual_storage, relative_path))
            .and_then(|record| record.replicas.get(storage).copied()))
    }

    async fn is_latest(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<bool, DatastoreError> {
        Ok(match lock(&self.repositories).get(&key(virtual_storage, relative_path)) {
            None => true,
            Some(record) => record.replicas.get(storage) == Some(&record.generation),
        })
    }

    async fn consistent_secondaries(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        primary: &str,
    ) -> Result<BTreeSet<String>, DatastoreError> {
        let repositories = lock(&self.repositories);
        let Some(record) = repositories.get(&key(virtual_storage, relative_path)) else {
            let mut assigned = self.assignments_of(None, virtual_storage);
            assigned.remove(primary);
            return Ok(assigned);
        };
        let Some(primary_generation) = record.replicas.get(primary) else {
            return Ok(BTreeSet::new());
        };
        Ok(record
            .replicas
            .iter()
            .filter(|(storage, generation)| {
                storage.as_str() != primary && *generation == primary_generation
            })
            .map(|(storage, _)| storage.clone())
            .collect())
    }

    async fn increment_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        primary: &str,
        secondaries: &[String],
    ) -> Result<Generation, DatastoreError> {
        let mut repositories = lock(&self.repositories);
        let record = repositories
            .entry(key(virtual_storage, relative_path))
            .or_insert_with(|| RepositoryRecord {
                virtual_storage: virtual_storage.to_string(),
                relative_path: relative_path.to_string(),
                generation: -1,
                primary: Some(primary.to_string()),
                replicas: BTreeMap::new(),
                assigned: BTreeSet::new(),
            });

        let next = if record.generation < 0 {
            0
        } else {
            if record.replicas.get(primary) != Some(&record.generation) {
                return Err(DatastoreError::WriteToOutdatedNodes {
                    virtual_storage: virtual_storage.to_string(),
                    relative_path: relative_path.to_string(),
                    primary: primary.to_string(),
                });
            }
            record.generation + 1
        };

        record.generation = next;
        record.replicas.insert(primary.to_string(), next);
        for secondary in secondaries {
            record.replicas.insert(secondary.clone(), next);
        }
        Ok(next)
    }

    async fn set_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
        generation: Generation,
    ) -> Result<(), DatastoreError> {
        let mut repositories = lock(&self.repositories);
        let record = repositories
            .entry(key(virtual_storage, relative_path))
            .or_insert_with(|| RepositoryRecord {
                virtual_storage: virtual_storage.to_string(),
                relative_path: relative_path.to_string(),
                generation,
                primary: None,
                replicas: BTreeMap::new(),
                assigned: BTreeSet::new(),
            });
        record.generation = record.generation.max(generation);
        record.replicas.insert(storage.to_string(), generation);
        Ok(())
    }

    async fn delete_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<(), DatastoreError> {
        lock(&self.repositories).remove(&key(virtual_storage, relative_path));
        Ok(())
    }

    async fn delete_replica(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<(), DatastoreError> {
        if let Some(record) = lock(&self.repositories).get_mut(&key(virtual_storage, relative_path)) {
            record.replicas.remove(storage);
        }
        Ok(())
    }

    async fn rename_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        new_relative_path: &str,
    ) -> Result<(), DatastoreError> {
        let mut repositories = lock(&self.repositories);
        if repositories.contains_key(&key(virtual_storage, new_relative_path)) {
            return Err(DatastoreError::RepositoryExists {
                virtual_storage: virtual_storage.to_string(),
                relative_path: new_relative_path.to_string(),
            });
        }
        let mut record = repositories
            .remove(&key(virtual_storage, relative_path))
            .ok_or_else(|| DatastoreError::RepositoryNotFound {
                virtual_storage: virtual_storage.to_string(),
                relative_path: relative_path.to_string(),
            })?;
        record.relative_path = new_relative_path.to_string();
        repositories.insert(key(virtual_storage, new_relative_path), record);
        Ok(())
    }

    async fn set_assignments(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storages: &[String],
    ) -> Result<(), DatastoreError> {
        let configured = self.configured(virtual_storage);
        if let Some(unknown) = storages.iter().find(|s| !configured.contains(*s)) {
            return Err(DatastoreError::InvalidAssignment(format!(
                "storage {unknown:?} is not configured in {virtual_storage}"
            )));
        }
        let mut repositories = lock(&self.repositories);
        let record = repositories
            .get_mut(&key(virtual_storage, relative_path))
            .ok_or_else(|| DatastoreError::RepositoryNotFound {
                virtual_storage: virtual_storage.to_string(),
                relative_path: relative_path.to_string(),
            })?;
        if let Some(primary) = &record.primary {
            if !storages.contains(primary) {
                return Err(DatastoreError::InvalidAssignment(format!(
                    "primary {primary:?} must stay assigned"
                )));
            }
        }
        record.assigned = storages.iter().cloned().collect();
        Ok(())
    }

    async fn set_primary(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        expected: Option<&str>,
        primary: Option<&str>,
    ) -> Result<bool, DatastoreError> {
        let mut repositories = lock(&self.repositories);
        let Some(record) = repositories.get_mut(&key(virtual_storage, relative_path)) else {
            return Ok(false);
        };
        if record.primary.as_deref() != expected {
            return Ok(false);
        }
        record.primary = primary.map(str::to_string);
        Ok(true)
    }

    async fn repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<Option<RepositoryRecord>, DatastoreError> {
        Ok(lock(&self.repositories)
            .get(&key(virtual_storage, relative_path))
            .cloned())
    }

    async fn repositories(
        &self,
        virtual_storage: &str,
    ) -> Result<Vec<RepositoryRecord>, DatastoreError> {
        Ok(lock(&self.repositories)
            .values()
            .filter(|record| record.virtual_storage == virtual_storage)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    events: BTreeMap<u64, ReplicationEvent>,
    /// Lock id to acquired flag.
    locks: HashMap<String, bool>,
}

#[derive(Debug)]
pub struct MemoryReplicationQueue {
    max_attempts: u32,
    state: Mutex<QueueState>,
}

impl MemoryReplicationQueue {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Every event ever enqueued, in id order.
    pub fn events(&self) -> Vec<ReplicationEvent> {
        lock(&self.state).events.values().cloned().collect()
    }

    pub fn is_locked(&self, lock_id: &str) -> bool {
        lock(&self.state).locks.get(lock_id).copied().unwrap_or(false)
    }
}

#[async_trait]
impl ReplicationEventQueue for MemoryReplicationQueue {
    async fn enqueue(
        &self,
        job: ReplicationJob,
        meta: EventMeta,
    ) -> Result<ReplicationEvent, DatastoreError> {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let lock_id = job.lock_id();
        state.locks.entry(lock_id.clone()).or_insert(false);
        let event = ReplicationEvent {
            id: state.next_id,
            state: JobState::Ready,
            attempt: 0,
            lock_id,
            created_at: Utc::now(),
            updated_at: None,
            job,
            meta,
        };
        state.events.insert(event.id, event.clone());
        Ok(event)
    }

    async fn dequeue(
        &self,
        virtual_storage: &str,
        target_storage: &str,
        count: usize,
    ) -> Result<Vec<ReplicationEvent>, DatastoreError> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;

        let mut claimed_locks = BTreeSet::new();
        let mut ids = Vec::new();
        for event in state.events.values() {
            if ids.len() >= count {
                break;
            }
            if event.job.virtual_storage != virtual_storage
                || event.job.target_node_storage != target_storage
                || !matches!(event.state, JobState::Ready | JobState::Failed)
            {
                continue;
            }
            // Only the oldest pending event of a lock is eligible.
            if !claimed_locks.insert(event.lock_id.clone()) {
                continue;
            }
            if state.locks.get(&event.lock_id).copied().unwrap_or(false) {
                continue;
            }
            ids.push(event.id);
        }

        let now = Utc::now();
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(event) = state.events.get_mut(&id) {
                event.state = JobState::InProgress;
                event.attempt += 1;
                event.updated_at = Some(now);
                state.locks.insert(event.lock_id.clone(), true);
                claimed.push(event.clone());
            }
        }
        Ok(claimed)
    }

    async fn acknowledge(&self, state: JobState, ids: &[u64]) -> Result<Vec<u64>, DatastoreError> {
        if !state.is_acknowledgeable() {
            return Err(DatastoreError::InvalidAcknowledgeState(state));
        }
        let mut guard = lock(&self.state);
        let queue = &mut *guard;
        let now = Utc::now();
        let mut acknowledged = Vec::new();
        for id in ids {
            let Some(event) = queue.events.get_mut(id) else {
                continue;
            };
            if event.state != JobState::InProgress {
                continue;
            }
            event.state = if state == JobState::Failed && event.attempt >= self.max_attempts {
                JobState::Dead
            } else {
                state
            };
            event.updated_at = Some(now);
            queue.locks.insert(event.lock_id.clone(), false);
            acknowledged.push(*id);
        }
        acknowledged.sort_unstable();
        Ok(acknowledged)
    }

    async fn acknowledge_stale(&self, stale_after: Duration) -> Result<u64, DatastoreError> {
        let mut guard = lock(&self.state);
        let queue = &mut *guard;
        let now = Utc::now();
        let stale_before = cutoff(now, stale_after);
        let mut released = 0;
        for event in queue.events.values_mut() {
            let stale = event.state == JobState::InProgress
                && event.updated_at.map(|at| at < stale_before).unwrap_or(true);
            if !stale {
                continue;
            }
            event.state = if event.attempt >= self.max_attempts {
                JobState::Dead
            } else {
                JobState::Failed
            };
            event.updated_at = Some(now);
            queue.locks.insert(event.lock_id.clone(), false);
            released += 1;
        }
        Ok(released)
    }

    async fn cancel_pending(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<Vec<u64>, DatastoreError> {
        let mut state = lock(&self.state);
        let now = Utc::now();
        let mut cancelled = Vec::new();
        for event in state.events.values_mut() {
            if event.job.virtual_storage == virtual_storage
                && event.job.relative_path == relative_path
                && matches!(event.state, JobState::Ready | JobState::Failed)
            {
                event.state = JobState::Cancelled;
                event.updated_at = Some(now);
                cancelled.push(event.id);
            }
        }
        Ok(cancelled)
    }

    async fn has_pending_update(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        target_storage: &str,
    ) -> Result<bool, DatastoreError> {
        Ok(lock(&self.state).events.values().any(|event| {
            event.job.change == super::ChangeType::Update
                && event.job.virtual_storage == virtual_storage
                && event.job.relative_path == relative_path
                && event.job.target_node_storage == target_storage
                && matches!(
                    event.state,
                    JobState::Ready | JobState::InProgress | JobState::Failed
                )
        }))
    }
}

#[derive(Debug, Clone, Copy)]
struct NodeStatus {
    last_contact_attempt_at: DateTime<Utc>,
    last_seen_active_at: Option<DateTime<Utc>>,
}

/// Health reports of every instance sharing this process, keyed by
/// (instance, virtual storage, storage).
#[derive(Debug, Default)]
pub struct MemoryHealthStore {
    statuses: Mutex<BTreeMap<(String, String, String), NodeStatus>>,
}

impl MemoryHealthStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HealthStatusStore for MemoryHealthStore {
    async fn report_health(
        &self,
        instance: &str,
        reports: &[HealthReport],
        now: DateTime<Utc>,
        participant_timeout: Duration,
        healthiness_timeout: Duration,
    ) -> Result<HealthySet, DatastoreError> {
        let mut statuses = lock(&self.statuses);
        for report in reports {
            let entry = statuses
                .entry((
                    instance.to_string(),
                    report.virtual_storage.clone(),
                    report.storage.clone(),
                ))
                .or_insert(NodeStatus {
                    last_contact_attempt_at: now,
                    last_seen_active_at: None,
                });
            entry.last_contact_attempt_at = now;
            if report.healthy {
                entry.last_seen_active_at = Some(now);
            }
        }

        let participant_cutoff = cutoff(now, participant_timeout);
        let active_cutoff = cutoff(now, healthiness_timeout);

        let participants: BTreeSet<&str> = statuses
            .iter()
            .filter(|(_, status)| status.last_contact_attempt_at >= participant_cutoff)
            .map(|((instance, _, _), _)| instance.as_str())
            .collect();
        let majority = participants.len() / 2 + 1;

        let mut votes: BTreeMap<(&str, &str), usize> = BTreeMap::new();
        for ((instance, vs, storage), status) in statuses.iter() {
            let active = status
                .last_seen_active_at
                .map(|seen| seen >= active_cutoff)
                .unwrap_or(false);
            if active && participants.contains(instance.as_str()) {
                *votes.entry((vs.as_str(), storage.as_str())).or_default() += 1;
            }
        }

        let mut healthy = HealthySet::default();
        for report in reports {
            let count = votes
                .get(&(report.virtual_storage.as_str(), report.storage.as_str()))
                .copied()
                .unwrap_or(0);
            if count >= majority {
                healthy.insert(&report.virtual_storage, &report.storage);
            }
        }
        Ok(healthy)
    }
}

/// Concrete in-memory stores, kept typed so tests can inspect them.
#[derive(Debug, Clone)]
pub struct MemoryDatastore {
    pub repositories: Arc<MemoryRepositoryStore>,
    pub queue: Arc<MemoryReplicationQueue>,
    pub health: Arc<MemoryHealthStore>,
}

impl MemoryDatastore {
    pub fn new(storages: ConfiguredStorages, max_attempts: u32) -> Self {
        Self {
            repositories: Arc::new(MemoryRepositoryStore::new(storages)),
            queue: Arc::new(MemoryReplicationQueue::new(max_attempts)),
            health: Arc::new(MemoryHealthStore::new()),
        }
    }

    pub fn datastore(&self) -> Datastore {
        Datastore {
            repositories: self.repositories.clone(),
            queue: self.queue.clone(),
            health: self.health.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::ChangeType;

    fn storages() -> ConfiguredStorages {
        [(
            "vs".to_string(),
            vec!["n1".to_string(), "n2".to_string(), "n3".to_string()],
        )]
        .into_iter()
        .collect()
    }

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn first_mutation_creates_repository() {
        let store = MemoryRepositoryStore::new(storages());
        assert!(store.is_latest("vs", "r", "n3").await.unwrap());
        assert_eq!(
            store.consistent_secondaries("vs", "r", "n1").await.unwrap(),
            ["n2", "n3"].iter().map(|s| s.to_string()).collect()
        );

        let generation = store
            .increment_generation("vs", "r", "n1", &names(&["n2"]))
            .await
            .unwrap();
        assert_eq!(generation, 0);
        let record = store.repository("vs", "r").await.unwrap().unwrap();
        assert_eq!(record.primary.as_deref(), Some("n1"));
        assert_eq!(record.generation, 0);
        assert!(!store.is_latest("vs", "r", "n3").await.unwrap());
        assert_eq!(store.generation("vs", "r", "n3").await.unwrap(), None);
    }

    #[tokio::test]
    async fn increment_updates_participants_only() {
        let store = MemoryRepositoryStore::new(storages());
        store.increment_generation("vs", "r", "n1", &names(&["n2", "n3"])).await.unwrap();
        let generation = store
            .increment_generation("vs", "r", "n1", &names(&["n2"]))
            .await
            .unwrap();
        assert_eq!(generation, 1);
        assert_eq!(store.generation("vs", "r", "n1").await.unwrap(), Some(1));
        assert_eq!(store.generation("vs", "r", "n2").await.unwrap(), Some(1));
        assert_eq!(store.generation("vs", "r", "n3").await.unwrap(), Some(0));
        assert_eq!(
            store.consistent_secondaries("vs", "r", "n1").await.unwrap(),
            ["n2".to_string()].into_iter().collect()
        );

        let err = store
            .increment_generation("vs", "r", "n3", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DatastoreError::WriteToOutdatedNodes { .. }));
    }

    #[tokio::test]
    async fn set_generation_tracks_maximum() {
        let store = MemoryRepositoryStore::new(storages());
        store.set_generation("vs", "r", "n2", 4).await.unwrap();
        store.set_generation("vs", "r", "n3", 2).await.unwrap();
        let record = store.repository("vs", "r").await.unwrap().unwrap();
        assert_eq!(record.generation, 4);
        assert_eq!(record.primary, None);
        assert!(store.is_latest("vs", "r", "n2").await.unwrap());
        assert!(!store.is_latest("vs", "r", "n3").await.unwrap());
    }

    #[tokio::test]
    async fn assignments_default_to_configured() {
        let store = MemoryRepositoryStore::new(storages());
        assert_eq!(store.host_assignments("vs", "r").await.unwrap().len(), 3);
        assert!(store.host_assignments("other", "r").await.unwrap().is_empty());

        store.increment_generation("vs", "r", "n1", &[]).await.unwrap();
        let err = store
            .set_assignments("vs", "r", &names(&["n2", "n3"]))
            .await
            .unwrap_err();
        assert!(matches!(err, DatastoreError::InvalidAssignment(_)));
        assert!(store.set_assignments("vs", "r", &names(&["n1", "n9"])).await.is_err());

        store.set_assignments("vs", "r", &names(&["n1", "n2"])).await.unwrap();
        assert_eq!(
            store.host_assignments("vs", "r").await.unwrap(),
            ["n1", "n2"].iter().map(|s| s.to_string()).collect()
        );
    }

    #[tokio::test]
    async fn rename_and_delete() {
        let store = MemoryRepositoryStore::new(storages());
        store.increment_generation("vs", "a", "n1", &[]).await.unwrap();
        store.increment_generation("vs", "b", "n1", &[]).await.unwrap();

        assert!(matches!(
            store.rename_repository("vs", "a", "b").await,
            Err(DatastoreError::RepositoryExists { .. })
        ));
        assert!(matches!(
            store.rename_repository("vs", "zzz", "c").await,
            Err(DatastoreError::RepositoryNotFound { .. })
        ));
        store.rename_repository("vs", "a", "c").await.unwrap();
        assert!(store.repository("vs", "a").await.unwrap().is_none());
        assert_eq!(
            store.repository("vs", "c").await.unwrap().unwrap().relative_path,
            "c"
        );

        store.delete_replica("vs", "c", "n1").await.unwrap();
        assert_eq!(store.generation("vs", "c", "n1").await.unwrap(), None);
        store.delete_repository("vs", "c").await.unwrap();
        assert!(store.repository("vs", "c").await.unwrap().is_none());
        assert_eq!(store.repositories("vs").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn set_primary_is_compare_and_set() {
        let store = MemoryRepositoryStore::new(storages());
        assert!(!store.set_primary("vs", "r", None, Some("n2")).await.unwrap());
        store.increment_generation("vs", "r", "n1", &[]).await.unwrap();
        assert!(!store.set_primary("vs", "r", Some("n3"), Some("n2")).await.unwrap());
        assert!(store.set_primary("vs", "r", Some("n1"), Some("n2")).await.unwrap());
        assert!(store.set_primary("vs", "r", Some("n2"), None).await.unwrap());
        assert_eq!(store.repository("vs", "r").await.unwrap().unwrap().primary, None);
    }

    fn update(target: &str, path: &str) -> ReplicationJob {
        ReplicationJob::new(ChangeType::Update, "vs", path, "n1", target)
    }

    #[tokio::test]
    async fn dequeue_respects_lock_and_fifo() {
        let queue = MemoryReplicationQueue::new(3);
        let first = queue.enqueue(update("n2", "r"), EventMeta::default()).await.unwrap();
        let second = queue.enqueue(update("n2", "r"), EventMeta::default()).await.unwrap();
        let other = queue.enqueue(update("n2", "s"), EventMeta::default()).await.unwrap();
        queue.enqueue(update("n3", "r"), EventMeta::default()).await.unwrap();

        let claimed = queue.dequeue("vs", "n2", 10).await.unwrap();
        let ids: Vec<u64> = claimed.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![first.id, other.id]);
        assert!(claimed.iter().all(|e| e.state == JobState::InProgress && e.attempt == 1));
        assert!(queue.is_locked(&first.lock_id));

        // The lock of "r" is held, nothing else is eligible.
        assert!(queue.dequeue("vs", "n2", 10).await.unwrap().is_empty());

        let acked = queue
            .acknowledge(JobState::Completed, &[first.id, second.id])
            .await
            .unwrap();
        assert_eq!(acked, vec![first.id]);
        assert!(!queue.is_locked(&first.lock_id));

        let claimed = queue.dequeue("vs", "n2", 10).await.unwrap();
        assert_eq!(claimed.iter().map(|e| e.id).collect::<Vec<_>>(), vec![second.id]);
        assert_eq!(claimed[0].job, second.job);
    }

    #[tokio::test]
    async fn failed_events_retry_until_dead() {
        let queue = MemoryReplicationQueue::new(2);
        let event = queue.enqueue(update("n2", "r"), EventMeta::default()).await.unwrap();

        queue.dequeue("vs", "n2", 1).await.unwrap();
        queue.acknowledge(JobState::Failed, &[event.id]).await.unwrap();
        assert_eq!(queue.events()[0].state, JobState::Failed);

        let retried = queue.dequeue("vs", "n2", 1).await.unwrap();
        assert_eq!(retried[0].attempt, 2);
        queue.acknowledge(JobState::Failed, &[event.id]).await.unwrap();
        assert_eq!(queue.events()[0].state, JobState::Dead);
        assert!(queue.dequeue("vs", "n2", 1).await.unwrap().is_empty());

        assert!(matches!(
            queue.acknowledge(JobState::Ready, &[event.id]).await,
            Err(DatastoreError::InvalidAcknowledgeState(JobState::Ready))
        ));
    }

    #[tokio::test]
    async fn stale_events_are_released() {
        let queue = MemoryReplicationQueue::new(3);
        let event = queue.enqueue(update("n2", "r"), EventMeta::default()).await.unwrap();
        queue.dequeue("vs", "n2", 1).await.unwrap();

        assert_eq!(queue.acknowledge_stale(Duration::from_secs(3600)).await.unwrap(), 0);
        assert!(queue.is_locked(&event.lock_id));

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(queue.acknowledge_stale(Duration::from_millis(1)).await.unwrap(), 1);
        assert_eq!(queue.events()[0].state, JobState::Failed);
        assert!(!queue.is_locked(&event.lock_id));
        assert_eq!(queue.dequeue("vs", "n2", 1).await.unwrap()[0].attempt, 2);
    }

    #[tokio::test]
    async fn cancel_pending_and_pending_updates() {
        let queue = MemoryReplicationQueue::new(3);
        let a = queue.enqueue(update("n2", "r"), EventMeta::default()).await.unwrap();
        let b = queue.enqueue(update("n3", "r"), EventMeta::default()).await.unwrap();
        queue.enqueue(update("n3", "other"), EventMeta::default()).await.unwrap();
        queue.dequeue("vs", "n3", 1).await.unwrap();

        assert!(queue.has_pending_update("vs", "r", "n2").await.unwrap());
        assert!(queue.has_pending_update("vs", "r", "n3").await.unwrap());
        assert!(!queue.has_pending_update("vs", "r", "n1").await.unwrap());

        let cancelled = queue.cancel_pending("vs", "r").await.unwrap();
        assert_eq!(cancelled, vec![a.id]);
        let events = queue.events();
        assert_eq!(events[0].state, JobState::Cancelled);
        assert_eq!(events[1].id, b.id);
        assert_eq!(events[1].state, JobState::InProgress);
        assert!(!queue.has_pending_update("vs", "r", "n2").await.unwrap());
    }

    fn reports(healthy: &[(&str, bool)]) -> Vec<HealthReport> {
        healthy
            .iter()
            .map(|(storage, ok)| HealthReport {
                virtual_storage: "vs".into(),
                storage: storage.to_string(),
                healthy: *ok,
            })
            .collect()
    }

    #[tokio::test]
    async fn health_needs_majority_of_participants() {
        let store = MemoryHealthStore::new();
        let now = Utc::now();
        let participant = Duration::from_secs(60);
        let healthiness = Duration::from_secs(10);

        let set = store
            .report_health("p1", &reports(&[("n1", true), ("n2", true)]), now, participant, healthiness)
            .await
            .unwrap();
        assert!(set.contains("vs", "n1") && set.contains("vs", "n2"));

        // Two more instances join and only see n1.
        store
            .report_health("p2", &reports(&[("n1", true), ("n2", false)]), now, participant, healthiness)
            .await
            .unwrap();
        let set = store
            .report_health("p3", &reports(&[("n1", true), ("n2", false)]), now, participant, healthiness)
            .await
            .unwrap();
        assert!(set.contains("vs", "n1"));
        assert!(!set.contains("vs", "n2"));

        // Much later p1 is the only participant left and n2 went stale.
        let later = now + chrono::Duration::seconds(120);
        let set = store
            .report_health("p1", &reports(&[("n1", true), ("n2", false)]), later, participant, healthiness)
            .await
            .unwrap();
        assert!(set.contains("vs", "n1"));
        assert!(!set.contains("vs", "n2"));
    }
}
