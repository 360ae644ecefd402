//! Shared helpers for integration tests: fake storage backends and an
//! in-process proxy wired to the in-memory datastore.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use bytes::Bytes;
use fleet_proxy::codec::RawCodec;
use fleet_proxy::config::Config;
use fleet_proxy::coordinator::{
    TRANSACTION_COORDINATOR_HEADER, TRANSACTION_ID_HEADER, TRANSACTION_VOTER_HEADER,
};
use fleet_proxy::datastore::{MemoryDatastore, RepositoryRecord};
use fleet_proxy::metrics::ProxyMetrics;
use fleet_proxy::nodes::Node;
use fleet_proxy::proto::{
    methods, HealthCheckRequest, HealthCheckResponse, Repository, ServingStatus,
    VoteTransactionRequest, VoteTransactionResponse, VoteTransactionState,
};
use fleet_proxy::server::App;
use fleet_voting::voting::VOTE_SIZE;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use http::uri::PathAndQuery;
use prost::Message;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tonic::codec::ProstCodec;
use tonic::metadata::MetadataMap;
use tonic::server::{Grpc, StreamingService, UnaryService};
use tonic::{Request, Response, Status, Streaming};

pub const VIRTUAL_STORAGE: &str = "vs";

/// Any request whose repository sits in field 1.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RepositoryRequest {
    #[prost(message, optional, tag = "1")]
    pub repository: Option<Repository>,
}

pub fn repository_frame(storage: &str, relative_path: &str) -> Bytes {
    RepositoryRequest {
        repository: Some(Repository::new(storage, relative_path)),
    }
    .encode_to_vec()
    .into()
}

/// Storage name carried by a fake backend's response frame.
pub fn answered_by(frame: &Bytes) -> String {
    RepositoryRequest::decode(frame.clone())
        .ok()
        .and_then(|request| request.repository)
        .map(|repository| repository.storage_name)
        .unwrap_or_default()
}

/// One call received by a fake backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub method: String,
    pub storage_name: String,
    pub relative_path: String,
    pub transaction_id: Option<u64>,
    pub voter: Option<String>,
}

struct BackendState {
    storage: String,
    vote: Mutex<[u8; VOTE_SIZE]>,
    failing: AtomicBool,
    calls: Mutex<Vec<Call>>,
}

fn header(metadata: &MetadataMap, key: &str) -> Option<String> {
    metadata
        .get(key)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

impl BackendState {
    async fn handle(
        self: Arc<Self>,
        method: String,
        request: Request<Streaming<Bytes>>,
    ) -> Result<Response<BoxStream<'static, Result<Bytes, Status>>>, Status> {
        let (metadata, _, mut frames) = request.into_parts();
        let first = frames
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("empty request"))?;
        while frames.message().await?.is_some() {}

        let repository = RepositoryRequest::decode(first)
            .map_err(|err| Status::invalid_argument(err.to_string()))?
            .repository
            .unwrap_or_default();
        let transaction_id = header(&metadata, TRANSACTION_ID_HEADER)
            .map(|id| id.parse::<u64>())
            .transpose()
            .map_err(|err| Status::invalid_argument(err.to_string()))?;
        let voter = header(&metadata, TRANSACTION_VOTER_HEADER);
        self.calls.lock().unwrap().push(Call {
            method,
            storage_name: repository.storage_name.clone(),
            relative_path: repository.relative_path.clone(),
            transaction_id,
            voter: voter.clone(),
        });

        if self.failing.load(Ordering::SeqCst) {
            return Err(Status::internal("backend failure"));
        }

        if let Some(transaction_id) = transaction_id {
            let coordinator = header(&metadata, TRANSACTION_COORDINATOR_HEADER)
                .ok_or_else(|| Status::invalid_argument("missing coordinator address"))?;
            let proxy = Node::new(VIRTUAL_STORAGE, "proxy", coordinator, "")
                .map_err(|err| Status::internal(err.to_string()))?;
            let hash = *self.vote.lock().unwrap();
            let response: VoteTransactionResponse = proxy
                .unary(
                    methods::VOTE_TRANSACTION,
                    Request::new(VoteTransactionRequest {
                        repository: Some(repository.clone()),
                        transaction_id,
                        node: voter.unwrap_or_default(),
                        reference_updates_hash: hash.to_vec(),
                    }),
                )
                .await?;
            if response.state != VoteTransactionState::Commit as i32 {
                return Err(Status::aborted("transaction was not committed"));
            }
        }

        let frame = repository_frame(&self.storage, &repository.relative_path);
        Ok(Response::new(
            futures_util::stream::once(async move { Ok(frame) }).boxed(),
        ))
    }
}

struct BackendCall {
    state: Arc<BackendState>,
    method: String,
}

impl StreamingService<Bytes> for BackendCall {
    type Response = Bytes;
    type ResponseStream = BoxStream<'static, Result<Bytes, Status>>;
    type Future = BoxFuture<'static, Result<Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: Request<Streaming<Bytes>>) -> Self::Future {
        let state = self.state.clone();
        let method = std::mem::take(&mut self.method);
        Box::pin(state.handle(method, request))
    }
}

struct BackendHealth;

impl UnaryService<HealthCheckRequest> for BackendHealth {
    type Response = HealthCheckResponse;
    type Future = BoxFuture<'static, Result<Response<HealthCheckResponse>, Status>>;

    fn call(&mut self, _request: Request<HealthCheckRequest>) -> Self::Future {
        Box::pin(async {
            Ok(Response::new(HealthCheckResponse {
                status: ServingStatus::Serving as i32,
            }))
        })
    }
}

async fn backend_dispatch(
    State(state): State<Arc<BackendState>>,
    request: axum::extract::Request,
) -> axum::response::Response {
    let method = request.uri().path().to_string();
    let response = if method == methods::HEALTH_CHECK {
        Grpc::new(ProstCodec::<HealthCheckResponse, HealthCheckRequest>::default())
            .unary(BackendHealth, request)
            .await
    } else {
        Grpc::new(RawCodec)
            .streaming(BackendCall { state, method }, request)
            .await
    };
    response.map(axum::body::Body::new)
}

/// A storage backend that records every call, votes a configurable hash on
/// transactional calls and answers with its storage name.
pub struct FakeBackend {
    pub storage: String,
    pub address: SocketAddr,
    state: Arc<BackendState>,
    stop: Option<oneshot::Sender<()>>,
}

impl FakeBackend {
    pub async fn start(storage: &str) -> Self {
        let state = Arc::new(BackendState {
            storage: storage.to_string(),
            vote: Mutex::new([1; VOTE_SIZE]),
            failing: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let router = axum::Router::new()
            .fallback(backend_dispatch)
            .with_state(state.clone());
        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = stopped.await;
                })
                .await;
        });
        Self {
            storage: storage.to_string(),
            address,
            state,
            stop: Some(stop),
        }
    }

    pub fn set_vote(&self, byte: u8) {
        *self.state.vote.lock().unwrap() = [byte; VOTE_SIZE];
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| call.method == method)
            .collect()
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

pub fn record(relative_path: &str, primary: &str, replicas: &[(&str, i64)]) -> RepositoryRecord {
    let replicas: BTreeMap<String, i64> = replicas
        .iter()
        .map(|(storage, generation)| (storage.to_string(), *generation))
        .collect();
    RepositoryRecord {
        virtual_storage: VIRTUAL_STORAGE.to_string(),
        relative_path: relative_path.to_string(),
        generation: replicas.values().copied().max().unwrap_or(0),
        primary: Some(primary.to_string()),
        replicas,
        assigned: BTreeSet::new(),
    }
}

/// A proxy in front of fake backends, backed by the in-memory datastore.
pub struct TestCluster {
    pub backends: Vec<FakeBackend>,
    pub data: MemoryDatastore,
    pub metrics: Arc<ProxyMetrics>,
    pub address: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<anyhow::Result<()>>>,
}

impl TestCluster {
    /// `extra` is appended to the generated configuration.
    pub async fn start(storages: &[&str], extra: &str, records: Vec<RepositoryRecord>) -> Self {
        let mut backends = Vec::new();
        for storage in storages {
            backends.push(FakeBackend::start(storage).await);
        }
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let mut toml = format!(
            r#"
listen_addr = "{address}"
transaction_callback_address = "tcp://{address}"
metrics_log_interval_ms = 0

[failover]
health_check_interval_ms = 200

[replication]
backoff_initial_ms = 50
backoff_max_ms = 200

[reconciliation]
scheduling_interval_ms = 0

[[virtual_storage]]
name = "{VIRTUAL_STORAGE}"
"#
        );
        for (i, backend) in backends.iter().enumerate() {
            toml.push_str(&format!(
                "\n[[virtual_storage.node]]\nstorage = \"{}\"\naddress = \"tcp://{}\"\ndefault_primary = {}\n",
                backend.storage,
                backend.address,
                i == 0
            ));
        }
        toml.push('\n');
        toml.push_str(extra);
        let config = Config::from_toml_str(&toml).unwrap();

        let data = MemoryDatastore::new(config.storages(), config.replication.max_attempts);
        for record in records {
            data.repositories.insert(record);
        }
        let app = App::build(config, data.datastore()).unwrap();
        let metrics = app.metrics().clone();
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(app.serve(listener, async {
            let _ = stopped.await;
        }));

        let cluster = Self {
            backends,
            data,
            metrics,
            address,
            stop: Some(stop),
            server: Some(server),
        };
        cluster.wait_until_serving().await;
        cluster
    }

    async fn wait_until_serving(&self) {
        let client = self.client("");
        eventually("proxy serving", || {
            let client = client.clone();
            async move {
                client
                    .unary::<_, HealthCheckResponse>(
                        methods::HEALTH_CHECK,
                        Request::new(HealthCheckRequest::default()),
                    )
                    .await
                    .is_ok()
            }
        })
        .await;
    }

    pub fn backend(&self, storage: &str) -> &FakeBackend {
        self.backends
            .iter()
            .find(|backend| backend.storage == storage)
            .unwrap()
    }

    /// A connection to the proxy presenting `token`.
    pub fn client(&self, token: &str) -> Node {
        Node::new(VIRTUAL_STORAGE, "proxy", format!("tcp://{}", self.address), token).unwrap()
    }

    /// Call `method` for `relative_path` through the proxy and collect the
    /// response frames.
    pub async fn call_with(
        &self,
        client: &Node,
        method: &'static str,
        relative_path: &str,
    ) -> Result<Vec<Bytes>, Status> {
        let frame = repository_frame(VIRTUAL_STORAGE, relative_path);
        let response = client
            .streaming(
                PathAndQuery::from_static(method),
                MetadataMap::new(),
                futures_util::stream::iter(vec![frame]),
            )
            .await?;
        let mut stream = response.into_inner();
        let mut frames = Vec::new();
        while let Some(frame) = stream.message().await? {
            frames.push(frame);
        }
        Ok(frames)
    }

    pub async fn call(&self, method: &'static str, relative_path: &str) -> Result<Vec<Bytes>, Status> {
        self.call_with(&self.client(""), method, relative_path).await
    }

    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(server) = self.server.take() {
            tokio::time::timeout(Duration::from_secs(10), server)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
        }
    }
}

/// Poll `check` until it holds, panicking after ten seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
