//! Replication workers.
//!
//! One loop per (virtual storage, target storage) drains the replication
//! queue while the target is healthy, runs each job against the target
//! through a [`Replicator`] and acknowledges the outcome.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures_util::{stream, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tonic::metadata::AsciiMetadataValue;
use tonic::{Code, Request, Status};

use crate::config::ConfiguredStorages;
use crate::datastore::{
    ChangeType, DatastoreError, JobState, ReplicationEvent, ReplicationEventQueue, ReplicationJob,
    RepositoryStore, PARAM_CREATE_BITMAP, PARAM_RELATIVE_PATH,
};
use crate::health::HealthChecker;
use crate::metrics::ProxyMetrics;
use crate::nodes::NodeSet;
use crate::proto::{
    methods, Empty, GarbageCollectRequest, RemoveRepositoryRequest, RenameRepositoryRequest,
    RepackFullRequest, RepackIncrementalRequest, ReplicateRepositoryRequest, Repository,
};

/// Metadata key carrying the addresses and tokens of source storages.
pub const GITALY_SERVERS_HEADER: &str = "gitaly-servers";

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("replication rpc failed: {0}")]
    Rpc(#[from] Status),
    #[error("job timed out after {0:?}")]
    Timeout(Duration),
    #[error("job parameter {0:?} missing")]
    MissingParam(&'static str),
    #[error(transparent)]
    Datastore(#[from] DatastoreError),
}

impl ReplicationError {
    /// Errors retrying cannot fix: the source is invalid or the repository
    /// is gone.
    pub fn is_permanent(&self) -> bool {
        match self {
            ReplicationError::Rpc(status) => {
                matches!(status.code(), Code::NotFound | Code::InvalidArgument)
            }
            ReplicationError::MissingParam(_) => true,
            ReplicationError::Timeout(_) | ReplicationError::Datastore(_) => false,
        }
    }
}

/// Executes one replication job against its target storage.
#[async_trait]
pub trait Replicator: Send + Sync {
    async fn replicate(&self, job: &ReplicationJob) -> Result<(), ReplicationError>;
}

/// Runs jobs with the storage service RPCs of the target node.
pub struct GrpcReplicator {
    nodes: NodeSet,
}

impl GrpcReplicator {
    pub fn new(nodes: NodeSet) -> Self {
        Self { nodes }
    }

    fn target_repository(job: &ReplicationJob) -> Option<Repository> {
        Some(Repository::new(job.target_node_storage.as_str(), job.relative_path.as_str()))
    }

    fn create_bitmap(job: &ReplicationJob) -> bool {
        job.params
            .get(PARAM_CREATE_BITMAP)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    /// `gitaly-servers` value telling the target how to reach the source.
    fn source_servers(&self, job: &ReplicationJob) -> Result<AsciiMetadataValue, Status> {
        let source = self
            .nodes
            .node(&job.virtual_storage, &job.source_node_storage)?;
        let servers = serde_json::json!({
            (source.storage()): {
                "address": source.address(),
                "token": source.token(),
            }
        });
        AsciiMetadataValue::try_from(STANDARD.encode(servers.to_string()))
            .map_err(|err| Status::internal(format!("invalid {GITALY_SERVERS_HEADER} value: {err}")))
    }
}

#[async_trait]
impl Replicator for GrpcReplicator {
    async fn replicate(&self, job: &ReplicationJob) -> Result<(), ReplicationError> {
        let target = self
            .nodes
            .node(&job.virtual_storage, &job.target_node_storage)?;
        let repository = Self::target_repository(job);

        match job.change {
            ChangeType::Update => {
                let mut request = Request::new(ReplicateRepositoryRequest {
                    repository,
                    source: Some(Repository::new(job.source_node_storage.as_str(), job.relative_path.as_str())),
                });
                request
                    .metadata_mut()
                    .insert(GITALY_SERVERS_HEADER, self.source_servers(job)?);
                target
                    .unary::<_, Empty>(methods::REPLICATE_REPOSITORY, request)
                    .await?;
            }
            ChangeType::Delete => {
                target
                    .unary::<_, Empty>(
                        methods::REMOVE_REPOSITORY,
                        Request::new(RemoveRepositoryRequest { repository }),
                    )
                    .await?;
            }
            ChangeType::Rename => {
                let relative_path = job
                    .params
                    .get(PARAM_RELATIVE_PATH)
                    .and_then(serde_json::Value::as_str)
                    .ok_or(ReplicationError::MissingParam(PARAM_RELATIVE_PATH))?;
                target
                    .unary::<_, Empty>(
                        methods::RENAME_REPOSITORY,
                        Request::new(RenameRepositoryRequest {
                            repository,
                            relative_path: relative_path.to_string(),
                        }),
                    )
                    .await?;
            }
            ChangeType::GarbageCollect => {
                target
                    .unary::<_, Empty>(
                        methods::GARBAGE_COLLECT,
                        Request::new(GarbageCollectRequest {
                            repository,
                            create_bitmap: Self::create_bitmap(job),
                        }),
                    )
                    .await?;
            }
            ChangeType::RepackFull => {
                target
                    .unary::<_, Empty>(
                        methods::REPACK_FULL,
                        Request::new(RepackFullRequest {
                            repository,
                            create_bitmap: Self::create_bitmap(job),
                        }),
                    )
                    .await?;
            }
            ChangeType::RepackIncremental => {
                target
                    .unary::<_, Empty>(
                        methods::REPACK_INCREMENTAL,
                        Request::new(RepackIncrementalRequest { repository }),
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ReplicationManagerConfig {
    pub batch_size: usize,
    /// Jobs run concurrently per target storage.
    pub workers: usize,
    pub job_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

/// Resolves once shutdown has been signalled. Never resolves if the sender
/// is gone without signalling.
async fn stopped(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// What one [`ReplicationManager::process_batch`] call did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub dequeued: usize,
    pub completed: usize,
    /// Events acknowledged as failed or dead.
    pub failed: usize,
}

pub struct ReplicationManager {
    storages: ConfiguredStorages,
    queue: Arc<dyn ReplicationEventQueue>,
    store: Arc<dyn RepositoryStore>,
    health: Arc<dyn HealthChecker>,
    replicator: Arc<dyn Replicator>,
    metrics: Arc<ProxyMetrics>,
    cfg: ReplicationManagerConfig,
}

impl ReplicationManager {
    pub fn new(
        storages: ConfiguredStorages,
        queue: Arc<dyn ReplicationEventQueue>,
        store: Arc<dyn RepositoryStore>,
        health: Arc<dyn HealthChecker>,
        replicator: Arc<dyn Replicator>,
        metrics: Arc<ProxyMetrics>,
        cfg: ReplicationManagerConfig,
    ) -> Self {
        Self {
            storages,
            queue,
            store,
            health,
            replicator,
            metrics,
            cfg,
        }
    }

    async fn run_job(&self, job: &ReplicationJob) -> Result<(), ReplicationError> {
        let source_generation = match job.change {
            ChangeType::Update => {
                self.store
                    .generation(&job.virtual_storage, &job.relative_path, &job.source_node_storage)
                    .await?
            }
            _ => None,
        };

        tokio::time::timeout(self.cfg.job_timeout, self.replicator.replicate(job))
            .await
            .map_err(|_| ReplicationError::Timeout(self.cfg.job_timeout))??;

        match job.change {
            ChangeType::Update => match source_generation {
                Some(generation) => {
                    self.store
                        .set_generation(
                            &job.virtual_storage,
                            &job.relative_path,
                            &job.target_node_storage,
                            generation,
                        )
                        .await?;
                }
                None => tracing::warn!(
                    virtual_storage = %job.virtual_storage,
                    relative_path = %job.relative_path,
                    source = %job.source_node_storage,
                    "replication source has no recorded generation"
                ),
            },
            ChangeType::Delete => {
                self.store
                    .delete_replica(&job.virtual_storage, &job.relative_path, &job.target_node_storage)
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Outcome of one event, or None when shutdown interrupted it.
    async fn process_event(
        &self,
        event: &ReplicationEvent,
        shutdown: watch::Receiver<bool>,
    ) -> Option<JobState> {
        let job = &event.job;
        let result = tokio::select! {
            result = self.run_job(job) => result,
            _ = stopped(shutdown) => return None,
        };

        match result {
            Ok(()) => {
                tracing::debug!(
                    event_id = event.id,
                    change = %job.change,
                    virtual_storage = %job.virtual_storage,
                    relative_path = %job.relative_path,
                    target = %job.target_node_storage,
                    "replication job completed"
                );
                self.metrics.record_replication_completed();
                Some(JobState::Completed)
            }
            Err(err) if err.is_permanent() => {
                tracing::warn!(
                    event_id = event.id,
                    change = %job.change,
                    virtual_storage = %job.virtual_storage,
                    relative_path = %job.relative_path,
                    target = %job.target_node_storage,
                    error = %err,
                    "replication job failed permanently"
                );
                if job.change == ChangeType::Update {
                    if let Err(err) = self
                        .store
                        .delete_replica(&job.virtual_storage, &job.relative_path, &job.target_node_storage)
                        .await
                    {
                        tracing::warn!(event_id = event.id, error = ?err, "failed to clear replica generation");
                    }
                }
                self.metrics.record_replication_dead();
                Some(JobState::Dead)
            }
            Err(err) => {
                tracing::warn!(
                    event_id = event.id,
                    attempt = event.attempt,
                    change = %job.change,
                    virtual_storage = %job.virtual_storage,
                    relative_path = %job.relative_path,
                    target = %job.target_node_storage,
                    error = %err,
                    "replication job failed"
                );
                self.metrics.record_replication_failed();
                Some(JobState::Failed)
            }
        }
    }

    /// Dequeue and run one batch for `target`.
    pub async fn process_batch(
        &self,
        virtual_storage: &str,
        target: &str,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<BatchOutcome, DatastoreError> {
        let events = self
            .queue
            .dequeue(virtual_storage, target, self.cfg.batch_size)
            .await?;
        let mut outcome = BatchOutcome {
            dequeued: events.len(),
            ..BatchOutcome::default()
        };
        if events.is_empty() {
            return Ok(outcome);
        }

        let outcomes: Vec<(u64, Option<JobState>)> = stream::iter(events)
            .map(|event| {
                let shutdown = shutdown.clone();
                async move {
                    let state = self.process_event(&event, shutdown).await;
                    (event.id, state)
                }
            })
            .buffer_unordered(self.cfg.workers.max(1))
            .collect()
            .await;

        let mut by_state: BTreeMap<&'static str, (JobState, Vec<u64>)> = BTreeMap::new();
        for (id, state) in outcomes {
            let Some(state) = state else { continue };
            match state {
                JobState::Completed => outcome.completed += 1,
                _ => outcome.failed += 1,
            }
            by_state
                .entry(state.as_str())
                .or_insert_with(|| (state, Vec::new()))
                .1
                .push(id);
        }
        for (state, ids) in by_state.into_values() {
            self.queue.acknowledge(state, &ids).await?;
        }
        Ok(outcome)
    }

    fn spawn_target(
        self: &Arc<Self>,
        virtual_storage: String,
        target: String,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut backoff = manager.cfg.backoff_initial;
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let outcome = if manager.health.healthy().contains(&virtual_storage, &target) {
                    match manager.process_batch(&virtual_storage, &target, &shutdown).await {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            tracing::warn!(
                                virtual_storage = %virtual_storage,
                                target = %target,
                                error = ?err,
                                "replication batch failed"
                            );
                            BatchOutcome::default()
                        }
                    }
                } else {
                    BatchOutcome::default()
                };

                // Failed events wait out the backoff before their next attempt.
                if outcome.dequeued > 0 && outcome.failed == 0 {
                    backoff = manager.cfg.backoff_initial;
                    continue;
                }
                let wait = backoff;
                backoff = (backoff * 2).min(manager.cfg.backoff_max);
                if outcome.failed > 0 {
                    tracing::debug!(
                        virtual_storage = %virtual_storage,
                        target = %target,
                        failed = outcome.failed,
                        wait_ms = wait.as_millis() as u64,
                        "backing off after failed replication jobs"
                    );
                }
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Periodically release events whose worker went away.
    fn spawn_stale_recovery(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let stale_after = manager.cfg.job_timeout * 2;
            let mut ticker =
                tokio::time::interval(manager.cfg.job_timeout.max(Duration::from_millis(100)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match manager.queue.acknowledge_stale(stale_after).await {
                            Ok(0) => {}
                            Ok(released) => tracing::info!(released, "released stale replication events"),
                            Err(err) => tracing::warn!(error = ?err, "stale replication event check failed"),
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

    /// Start one worker loop per configured storage plus stale-event recovery.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for (virtual_storage, storages) in &self.storages {
            for target in storages {
                handles.push(self.spawn_target(virtual_storage.clone(), target.clone(), shutdown.clone()));
            }
        }
        handles.push(self.spawn_stale_recovery(shutdown));
        handles
    }
}
