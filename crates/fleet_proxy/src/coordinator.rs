//! Per-RPC routing and bookkeeping.
//!
//! [`Coordinator::route`] turns a method name and the first request frame
//! into the set of backends to stream to, each with its own rewritten first
//! frame and extra headers. Mutators additionally carry a [`Finalizer`] that
//! runs once every backend has finished: it settles the vote, bumps
//! generations and queues replication for replicas that did not keep up.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use fleet_voting::voting::{CancelHandle, TransactionError, TransactionManager, TransactionState, Voter};
use prost::Message;
use tokio::sync::RwLock;
use tonic::Status;

use crate::datastore::{
    ChangeType, DatastoreError, EventMeta, ReplicationEventQueue, ReplicationJob, RepositoryStore,
    PARAM_CREATE_BITMAP, PARAM_RELATIVE_PATH,
};
use crate::metrics::ProxyMetrics;
use crate::proto::{methods, GarbageCollectRequest, RenameRepositoryRequest, RepackFullRequest};
use crate::protoregistry::{MethodInfo, OpType, Registry, RequestFrame, Scope};
use crate::router::{RouterError, Router};

pub const TRANSACTION_ID_HEADER: &str = "transaction-id";
pub const TRANSACTION_VOTER_HEADER: &str = "transaction-voter-name";
pub const TRANSACTION_COORDINATOR_HEADER: &str = "transaction-coordinator-address";

/// Status returned to the client when its vote lost.
pub const PRIMARY_FAILED_VOTE: &str = "primary failed vote";

/// Status for voting errors surfaced through the transaction service.
pub fn transaction_status(err: TransactionError) -> Status {
    let message = err.to_string();
    match err {
        TransactionError::NotFound(_) => Status::not_found(message),
        TransactionError::UnknownVoter(_)
        | TransactionError::InvalidVoteLength(_)
        | TransactionError::NotVoted(_)
        | TransactionError::DuplicateVote(_) => Status::invalid_argument(message),
        TransactionError::Aborted
        | TransactionError::Cancelled
        | TransactionError::Stopped => Status::aborted(message),
        TransactionError::Timeout => Status::deadline_exceeded(message),
        TransactionError::NoVoters
        | TransactionError::DuplicateVoter(_)
        | TransactionError::InvalidThreshold { .. } => Status::internal(message),
    }
}

/// Strict majority of `voters` equal-weight votes: `voters / 2 + 1`.
///
/// For an even number of voters this is one more than half, so a split
/// vote never reaches quorum.
pub fn vote_threshold(voters: usize) -> u32 {
    (voters / 2 + 1) as u32
}

/// One backend an RPC is streamed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub storage: String,
    /// First request frame, rewritten for this storage.
    pub frame: Bytes,
    /// Extra request metadata for this storage.
    pub headers: Vec<(&'static str, String)>,
}

impl Destination {
    fn new(storage: impl Into<String>, frame: Bytes) -> Self {
        Self {
            storage: storage.into(),
            frame,
            headers: Vec::new(),
        }
    }
}

/// Everything the stream director needs to run one RPC.
pub struct StreamParameters {
    pub virtual_storage: String,
    pub operation: OpType,
    /// The backend whose response the client sees.
    pub primary: Destination,
    /// Backends whose responses are observed and discarded.
    pub secondaries: Vec<Destination>,
    pub finalizer: Option<Finalizer>,
}

impl StreamParameters {
    pub fn transaction_id(&self) -> Option<u64> {
        self.finalizer
            .as_ref()
            .and_then(|finalizer| finalizer.transaction.as_ref())
            .map(CancelHandle::id)
    }
}

/// What a successful mutator leaves behind for the replicas that missed it.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Followup {
    Update,
    Delete,
    Rename { new_relative_path: String },
    Maintenance { change: ChangeType, create_bitmap: bool },
    /// Maintenance without a replication counterpart.
    None,
}

/// Settles a mutator once all backends are done.
pub struct Finalizer {
    store: Arc<dyn RepositoryStore>,
    queue: Arc<dyn ReplicationEventQueue>,
    metrics: Arc<ProxyMetrics>,
    virtual_storage: String,
    relative_path: String,
    primary: String,
    secondaries: Vec<String>,
    replication_targets: Vec<String>,
    followup: Followup,
    transaction: Option<CancelHandle>,
    registered: bool,
    /// State captured when the transaction was cancelled early.
    state: Option<TransactionState>,
}

impl Finalizer {
    /// Stop voting now: undecided voters abort. Used when the primary failed
    /// so secondaries waiting for a quorum are released.
    pub fn cancel_transaction(&mut self) {
        if let Some(handle) = self.transaction.take() {
            self.state = handle.cancel();
        }
    }

    /// Cancel the transaction (if any) and record the outcome.
    /// `primary_ok` is whether the primary's RPC succeeded; `succeeded` names
    /// the secondaries whose RPC succeeded.
    pub async fn finish(mut self, primary_ok: bool, succeeded: &BTreeSet<String>) -> Result<(), Status> {
        self.cancel_transaction();
        let voted = self.state.take().filter(|state| state.subtransactions > 0);
        if self.registered {
            self.record_transaction(voted.as_ref());
        }

        if let Followup::Maintenance { change, create_bitmap } = &self.followup {
            if primary_ok {
                let targets = self.others();
                let jobs = targets
                    .iter()
                    .map(|target| {
                        let job = self.job(*change, target);
                        if *create_bitmap {
                            job.with_param(PARAM_CREATE_BITMAP, true)
                        } else {
                            job
                        }
                    })
                    .collect();
                self.schedule(jobs).await?;
            }
            return Ok(());
        }
        if self.followup == Followup::None {
            return Ok(());
        }

        let committed: Vec<String> = match &voted {
            None if !primary_ok => return Ok(()),
            None => Vec::new(),
            Some(state) if !state.committed(&self.primary) => {
                tracing::info!(
                    virtual_storage = %self.virtual_storage,
                    relative_path = %self.relative_path,
                    primary = %self.primary,
                    "primary lost the vote"
                );
                return Err(Status::failed_precondition(PRIMARY_FAILED_VOTE));
            }
            Some(state) => self
                .secondaries
                .iter()
                .filter(|storage| state.committed(storage) && succeeded.contains(*storage))
                .cloned()
                .collect(),
        };
        let outdated: Vec<String> = self
            .others()
            .into_iter()
            .filter(|storage| !committed.contains(storage))
            .collect();

        match &self.followup {
            Followup::Update => {
                self.store
                    .increment_generation(&self.virtual_storage, &self.relative_path, &self.primary, &committed)
                    .await
                    .map_err(|err| self.datastore_failure("increment generation", err))?;
                let jobs = outdated.iter().map(|target| self.job(ChangeType::Update, target)).collect();
                self.schedule(jobs).await
            }
            Followup::Delete => {
                let cancelled = self
                    .queue
                    .cancel_pending(&self.virtual_storage, &self.relative_path)
                    .await
                    .map_err(|err| self.datastore_failure("cancel pending events", err))?;
                if !cancelled.is_empty() {
                    tracing::info!(
                        virtual_storage = %self.virtual_storage,
                        relative_path = %self.relative_path,
                        cancelled = cancelled.len(),
                        "cancelled replication events of deleted repository"
                    );
                }
                self.store
                    .delete_repository(&self.virtual_storage, &self.relative_path)
                    .await
                    .map_err(|err| self.datastore_failure("delete repository", err))?;
                let jobs = outdated.iter().map(|target| self.job(ChangeType::Delete, target)).collect();
                self.schedule(jobs).await
            }
            Followup::Rename { new_relative_path } => {
                match self
                    .store
                    .rename_repository(&self.virtual_storage, &self.relative_path, new_relative_path)
                    .await
                {
                    Ok(()) | Err(DatastoreError::RepositoryNotFound { .. }) => {}
                    Err(err) => return Err(self.datastore_failure("rename repository", err)),
                }
                let jobs = outdated
                    .iter()
                    .map(|target| {
                        self.job(ChangeType::Rename, target)
                            .with_param(PARAM_RELATIVE_PATH, new_relative_path.as_str())
                    })
                    .collect();
                self.schedule(jobs).await
            }
            Followup::Maintenance { .. } | Followup::None => Ok(()),
        }
    }

    fn record_transaction(&self, voted: Option<&TransactionState>) {
        match voted {
            Some(state) => self
                .metrics
                .record_transaction_outcome(state.committed(&self.primary), false),
            None => self.metrics.record_transaction_outcome(false, true),
        }
    }

    /// Secondaries plus replication targets.
    fn others(&self) -> Vec<String> {
        self.secondaries
            .iter()
            .chain(&self.replication_targets)
            .cloned()
            .collect()
    }

    fn job(&self, change: ChangeType, target: &str) -> ReplicationJob {
        ReplicationJob::new(
            change,
            self.virtual_storage.as_str(),
            self.relative_path.as_str(),
            self.primary.as_str(),
            target,
        )
    }

    fn datastore_failure(&self, step: &'static str, err: DatastoreError) -> Status {
        tracing::warn!(
            virtual_storage = %self.virtual_storage,
            relative_path = %self.relative_path,
            primary = %self.primary,
            step,
            error = %err,
            "finalizer failed"
        );
        self.metrics.record_finalizer_error();
        Status::internal(format!("{step}: {err}"))
    }

    async fn schedule(&self, jobs: Vec<ReplicationJob>) -> Result<(), Status> {
        let count = jobs.len() as u64;
        for job in jobs {
            tracing::debug!(
                change = %job.change,
                virtual_storage = %job.virtual_storage,
                relative_path = %job.relative_path,
                target = %job.target_node_storage,
                "scheduling replication job"
            );
            self.queue
                .enqueue(job, EventMeta::default())
                .await
                .map_err(|err| self.datastore_failure("enqueue replication job", err))?;
        }
        if count > 0 {
            self.metrics.record_replication_scheduled(count);
        }
        Ok(())
    }
}

pub struct Coordinator {
    registry: Registry,
    router: Router,
    transactions: Arc<TransactionManager>,
    store: Arc<dyn RepositoryStore>,
    queue: Arc<dyn ReplicationEventQueue>,
    metrics: Arc<ProxyMetrics>,
    failover_lock: Arc<RwLock<()>>,
    coordinator_address: Option<String>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Registry,
        router: Router,
        transactions: Arc<TransactionManager>,
        store: Arc<dyn RepositoryStore>,
        queue: Arc<dyn ReplicationEventQueue>,
        metrics: Arc<ProxyMetrics>,
        failover_lock: Arc<RwLock<()>>,
        coordinator_address: Option<String>,
    ) -> Self {
        Self {
            registry,
            router,
            transactions,
            store,
            queue,
            metrics,
            failover_lock,
            coordinator_address,
        }
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    pub fn metrics(&self) -> &Arc<ProxyMetrics> {
        &self.metrics
    }

    fn router_error(&self, err: RouterError) -> Status {
        self.metrics.record_router_error();
        tracing::warn!(error = %err, "routing failed");
        err.into()
    }

    /// Decide where `method` goes, given its first request frame.
    ///
    /// A failover cannot run while the decision is made. The lock is
    /// released before the RPC is proxied.
    pub async fn route(&self, method: &str, first_frame: Bytes) -> Result<StreamParameters, Status> {
        let info = self.registry.lookup(method)?;
        let _failover = self.failover_lock.read().await;
        self.metrics.record_rpc(info.operation());
        let request = info.decode_request(first_frame.clone())?;

        match info.scope() {
            Scope::Repository => self.route_repository(info, request).await,
            Scope::Storage => self.route_storage(info, request),
            Scope::Server => {
                let (virtual_storage, storage) =
                    self.router.route_server().map_err(|err| self.router_error(err))?;
                Ok(StreamParameters {
                    virtual_storage,
                    operation: info.operation(),
                    primary: Destination::new(storage, first_frame),
                    secondaries: Vec::new(),
                    finalizer: None,
                })
            }
        }
    }

    async fn route_repository(
        &self,
        info: &MethodInfo,
        request: RequestFrame<'_>,
    ) -> Result<StreamParameters, Status> {
        let repository = request.target_repo()?;
        let virtual_storage = repository.storage_name;
        let relative_path = repository.relative_path;
        if virtual_storage.is_empty() {
            return Err(Status::invalid_argument("repository has no storage name"));
        }
        if relative_path.is_empty() {
            return Err(Status::invalid_argument("repository has no relative path"));
        }

        if info.operation() == OpType::Accessor {
            let storage = self
                .router
                .route_repository_accessor(&virtual_storage, &relative_path)
                .await
                .map_err(|err| self.router_error(err))?;
            return Ok(StreamParameters {
                operation: info.operation(),
                primary: Destination::new(storage.as_str(), rewrite(&request, &storage)?),
                virtual_storage,
                secondaries: Vec::new(),
                finalizer: None,
            });
        }

        let route = self
            .router
            .route_repository_mutator(&virtual_storage, &relative_path)
            .await
            .map_err(|err| self.router_error(err))?;
        let followup = followup(info, &request)?;

        let mut primary = Destination::new(route.primary.as_str(), rewrite(&request, &route.primary)?);
        let mut secondaries = Vec::new();
        let mut transaction = None;

        if info.operation() == OpType::Mutator {
            for storage in &route.secondaries {
                secondaries.push(Destination::new(storage.as_str(), rewrite(&request, storage)?));
            }
            if !route.secondaries.is_empty() {
                let participants = route.participants();
                let voters = participants.iter().map(|name| Voter::new(name.as_str(), 1)).collect();
                let (id, handle) = self
                    .transactions
                    .register(voters, vote_threshold(participants.len()))
                    .map_err(transaction_status)?;
                self.metrics.record_transaction_registered();
                tracing::debug!(
                    transaction_id = id,
                    virtual_storage = %virtual_storage,
                    relative_path = %relative_path,
                    primary = %route.primary,
                    secondaries = ?route.secondaries,
                    "registered transaction"
                );
                for destination in std::iter::once(&mut primary).chain(secondaries.iter_mut()) {
                    destination.headers.push((TRANSACTION_ID_HEADER, id.to_string()));
                    destination
                        .headers
                        .push((TRANSACTION_VOTER_HEADER, destination.storage.clone()));
                    if let Some(address) = &self.coordinator_address {
                        destination
                            .headers
                            .push((TRANSACTION_COORDINATOR_HEADER, address.clone()));
                    }
                }
                transaction = Some(handle);
            }
        }

        // Maintenance runs on the primary only; the other replicas get jobs.
        let (finalizer_secondaries, replication_targets) = match info.operation() {
            OpType::Mutator => (route.secondaries, route.replication_targets),
            _ => (
                Vec::new(),
                route
                    .secondaries
                    .into_iter()
                    .chain(route.replication_targets)
                    .collect(),
            ),
        };

        Ok(StreamParameters {
            virtual_storage: virtual_storage.clone(),
            operation: info.operation(),
            primary,
            secondaries,
            finalizer: Some(Finalizer {
                store: self.store.clone(),
                queue: self.queue.clone(),
                metrics: self.metrics.clone(),
                virtual_storage,
                relative_path,
                primary: route.primary,
                secondaries: finalizer_secondaries,
                replication_targets,
                followup,
                registered: transaction.is_some(),
                transaction,
                state: None,
            }),
        })
    }

    fn route_storage(
        &self,
        info: &MethodInfo,
        request: RequestFrame<'_>,
    ) -> Result<StreamParameters, Status> {
        let virtual_storage = request.target_storage()?;
        if info.operation() == OpType::Accessor {
            let storage = self
                .router
                .route_storage_accessor(&virtual_storage)
                .map_err(|err| self.router_error(err))?;
            return Ok(StreamParameters {
                operation: info.operation(),
                primary: Destination::new(storage.as_str(), rewrite(&request, &storage)?),
                virtual_storage,
                secondaries: Vec::new(),
                finalizer: None,
            });
        }

        let route = self
            .router
            .route_storage_mutator(&virtual_storage)
            .map_err(|err| self.router_error(err))?;
        let primary = Destination::new(route.primary.as_str(), rewrite(&request, &route.primary)?);
        let secondaries = route
            .secondaries
            .iter()
            .map(|storage| Ok(Destination::new(storage.as_str(), rewrite(&request, storage)?)))
            .collect::<Result<Vec<_>, Status>>()?;
        Ok(StreamParameters {
            virtual_storage,
            operation: info.operation(),
            primary,
            secondaries,
            finalizer: None,
        })
    }
}

fn rewrite(request: &RequestFrame<'_>, storage: &str) -> Result<Bytes, Status> {
    let mut request = request.clone();
    request.set_target_storage(storage)?;
    Ok(request.encode())
}

fn followup(info: &MethodInfo, request: &RequestFrame<'_>) -> Result<Followup, Status> {
    let decode_error = |err: prost::DecodeError| Status::invalid_argument(format!("malformed request: {err}"));
    Ok(match info.name() {
        methods::REMOVE_REPOSITORY => Followup::Delete,
        methods::RENAME_REPOSITORY => {
            let rename = RenameRepositoryRequest::decode(request.clone().encode()).map_err(decode_error)?;
            if rename.relative_path.is_empty() {
                return Err(Status::invalid_argument("rename has no destination path"));
            }
            Followup::Rename {
                new_relative_path: rename.relative_path,
            }
        }
        methods::GARBAGE_COLLECT => Followup::Maintenance {
            change: ChangeType::GarbageCollect,
            create_bitmap: GarbageCollectRequest::decode(request.clone().encode())
                .map_err(decode_error)?
                .create_bitmap,
        },
        methods::REPACK_FULL => Followup::Maintenance {
            change: ChangeType::RepackFull,
            create_bitmap: RepackFullRequest::decode(request.clone().encode())
                .map_err(decode_error)?
                .create_bitmap,
        },
        methods::REPACK_INCREMENTAL => Followup::Maintenance {
            change: ChangeType::RepackIncremental,
            create_bitmap: false,
        },
        _ if info.operation() == OpType::Maintenance => Followup::None,
        _ => Followup::Update,
    })
}
