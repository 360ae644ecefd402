//! Persistent cluster state: repository generations and assignments, the
//! replication queue and per-instance health reports.
//!
//! Each concern sits behind an async trait with an in-memory implementation
//! (single instance, tests) and a PostgreSQL implementation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConfiguredStorages;
use crate::health::HealthySet;

mod memory;
mod postgres;

pub use memory::{MemoryDatastore, MemoryHealthStore, MemoryReplicationQueue, MemoryRepositoryStore};
pub use postgres::PostgresStore;

/// Number of successful mutations a replica has absorbed.
pub type Generation = i64;

#[derive(Debug, thiserror::Error)]
pub enum DatastoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(
        "primary {primary:?} of {virtual_storage}/{relative_path} is not on the latest generation"
    )]
    WriteToOutdatedNodes {
        virtual_storage: String,
        relative_path: String,
        primary: String,
    },
    #[error("repository {virtual_storage}/{relative_path} not found")]
    RepositoryNotFound {
        virtual_storage: String,
        relative_path: String,
    },
    #[error("repository {virtual_storage}/{relative_path} already exists")]
    RepositoryExists {
        virtual_storage: String,
        relative_path: String,
    },
    #[error("invalid assignment: {0}")]
    InvalidAssignment(String),
    #[error("events cannot be acknowledged as {0}")]
    InvalidAcknowledgeState(JobState),
    #[error("invalid job state {0:?}")]
    InvalidJobState(String),
}

/// Everything known about one repository of a virtual storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRecord {
    pub virtual_storage: String,
    pub relative_path: String,
    /// Highest generation of any replica.
    pub generation: Generation,
    pub primary: Option<String>,
    /// Generation of every storage that holds a replica.
    pub replicas: BTreeMap<String, Generation>,
    /// Explicit assignments. Empty means every configured storage.
    pub assigned: BTreeSet<String>,
}

impl RepositoryRecord {
    /// Storages whose replica is behind the repository generation, or that
    /// have none, among `storages`.
    pub fn outdated<'a>(&self, storages: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        storages
            .into_iter()
            .filter(|storage| self.replicas.get(*storage) != Some(&self.generation))
            .cloned()
            .collect()
    }
}

#[async_trait]
pub trait AssignmentGetter: Send + Sync {
    /// Storages allowed to host the repository: explicit assignments or every
    /// configured storage of the virtual storage.
    async fn host_assignments(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<BTreeSet<String>, DatastoreError>;
}

#[async_trait]
pub trait RepositoryStore: AssignmentGetter {
    async fn generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<Option<Generation>, DatastoreError>;

    /// True when `storage` is on the repository generation, or when the
    /// repository is not tracked yet.
    async fn is_latest(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<bool, DatastoreError>;

    /// Storages other than `primary` on the primary's generation.
    async fn consistent_secondaries(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        primary: &str,
    ) -> Result<BTreeSet<String>, DatastoreError>;

    /// Record a successful mutation: bump the repository generation and set
    /// the primary and every participating secondary to it. The first
    /// mutation of an untracked repository creates it at generation 0 with
    /// `primary` as its primary.
    async fn increment_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        primary: &str,
        secondaries: &[String],
    ) -> Result<Generation, DatastoreError>;

    async fn set_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
        generation: Generation,
    ) -> Result<(), DatastoreError>;

    /// Forget the repository with all replicas and assignments.
    async fn delete_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<(), DatastoreError>;

    /// Forget one replica's generation.
    async fn delete_replica(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<(), DatastoreError>;

    async fn rename_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        new_relative_path: &str,
    ) -> Result<(), DatastoreError>;

    /// Replace the explicit assignments. The current primary must stay
    /// assigned.
    async fn set_assignments(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storages: &[String],
    ) -> Result<(), DatastoreError>;

    /// Compare-and-set the primary. Returns false when the repository does
    /// not exist or its primary is not `expected`.
    async fn set_primary(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        expected: Option<&str>,
        primary: Option<&str>,
    ) -> Result<bool, DatastoreError>;

    async fn repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<Option<RepositoryRecord>, DatastoreError>;

    async fn repositories(
        &self,
        virtual_storage: &str,
    ) -> Result<Vec<RepositoryRecord>, DatastoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Ready,
    InProgress,
    Failed,
    Dead,
    Completed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Ready => "ready",
            JobState::InProgress => "in_progress",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
            JobState::Completed => "completed",
            JobState::Cancelled => "cancelled",
        }
    }

    /// States an in-progress event may be acknowledged with.
    pub fn is_acknowledgeable(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Dead | JobState::Cancelled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DatastoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ready" => JobState::Ready,
            "in_progress" => JobState::InProgress,
            "failed" => JobState::Failed,
            "dead" => JobState::Dead,
            "completed" => JobState::Completed,
            "cancelled" => JobState::Cancelled,
            other => return Err(DatastoreError::InvalidJobState(other.to_string())),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    #[serde(rename = "update")]
    Update,
    #[serde(rename = "delete")]
    Delete,
    #[serde(rename = "rename")]
    Rename,
    #[serde(rename = "gc")]
    GarbageCollect,
    #[serde(rename = "repack-full")]
    RepackFull,
    #[serde(rename = "repack-inc")]
    RepackIncremental,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
            ChangeType::Rename => "rename",
            ChangeType::GarbageCollect => "gc",
            ChangeType::RepackFull => "repack-full",
            ChangeType::RepackIncremental => "repack-inc",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job parameter carrying the new relative path of a rename.
pub const PARAM_RELATIVE_PATH: &str = "relative_path";
/// Job parameter for gc and full repacks.
pub const PARAM_CREATE_BITMAP: &str = "create_bitmap";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationJob {
    pub change: ChangeType,
    pub virtual_storage: String,
    pub relative_path: String,
    pub source_node_storage: String,
    pub target_node_storage: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl ReplicationJob {
    pub fn new(
        change: ChangeType,
        virtual_storage: impl Into<String>,
        relative_path: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            change,
            virtual_storage: virtual_storage.into(),
            relative_path: relative_path.into(),
            source_node_storage: source.into(),
            target_node_storage: target.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Serializes every job for one replica of one repository.
    pub fn lock_id(&self) -> String {
        format!(
            "{}|{}|{}",
            self.virtual_storage, self.target_node_storage, self.relative_path
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationEvent {
    pub id: u64,
    pub state: JobState,
    pub attempt: u32,
    pub lock_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub job: ReplicationJob,
    pub meta: EventMeta,
}

#[async_trait]
pub trait ReplicationEventQueue: Send + Sync {
    /// Insert a `ready` event, creating its lock if needed.
    async fn enqueue(
        &self,
        job: ReplicationJob,
        meta: EventMeta,
    ) -> Result<ReplicationEvent, DatastoreError>;

    /// Claim up to `count` events targeting `target_storage`: the oldest
    /// `ready` or `failed` event of every free lock. Claimed events become
    /// `in_progress` and their locks are acquired.
    async fn dequeue(
        &self,
        virtual_storage: &str,
        target_storage: &str,
        count: usize,
    ) -> Result<Vec<ReplicationEvent>, DatastoreError>;

    /// Move in-progress events to `state` and release their locks. A `failed`
    /// event that used up its attempts becomes `dead`. Returns the ids that
    /// were acknowledged.
    async fn acknowledge(&self, state: JobState, ids: &[u64]) -> Result<Vec<u64>, DatastoreError>;

    /// Fail every event that has been `in_progress` for longer than
    /// `stale_after`, releasing its lock. Such events belong to workers that
    /// stopped without acknowledging. Returns how many were released.
    async fn acknowledge_stale(&self, stale_after: Duration) -> Result<u64, DatastoreError>;

    /// Cancel every `ready` or `failed` event of a repository.
    async fn cancel_pending(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<Vec<u64>, DatastoreError>;

    /// Whether an `update` to `target_storage` is already queued or running.
    async fn has_pending_update(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        target_storage: &str,
    ) -> Result<bool, DatastoreError>;
}

/// One probe result of this instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub virtual_storage: String,
    pub storage: String,
    pub healthy: bool,
}

#[async_trait]
pub trait HealthStatusStore: Send + Sync {
    /// Record this instance's probe results and return the storages a
    /// majority of recently active instances currently consider healthy.
    async fn report_health(
        &self,
        instance: &str,
        reports: &[HealthReport],
        now: DateTime<Utc>,
        participant_timeout: Duration,
        healthiness_timeout: Duration,
    ) -> Result<HealthySet, DatastoreError>;
}

pub(crate) fn cutoff(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    let timeout = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(36_500));
    now - timeout
}

/// Trait-object handles to the three stores.
#[derive(Clone)]
pub struct Datastore {
    pub repositories: Arc<dyn RepositoryStore>,
    pub queue: Arc<dyn ReplicationEventQueue>,
    pub health: Arc<dyn HealthStatusStore>,
}

impl Datastore {
    pub fn memory(storages: ConfiguredStorages, max_attempts: u32) -> Self {
        MemoryDatastore::new(storages, max_attempts).datastore()
    }

    pub fn postgres(store: Arc<PostgresStore>) -> Self {
        Self {
            repositories: store.clone(),
            queue: store.clone(),
            health: store,
        }
    }
}
