//! gRPC front end.
//!
//! Every call lands in one axum fallback handler. Transaction voting and
//! health checks are answered locally; everything else is routed by the
//! [`Coordinator`] and streamed to the chosen backends as raw frames. The
//! client sees the primary's response, secondaries are drained in the
//! background, and the finalizer runs once every backend is done.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::extract::State;
use bytes::Bytes;
use fleet_voting::voting::{TransactionError, VoteResult};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use http::uri::PathAndQuery;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codec::ProstCodec;
use tonic::metadata::{AsciiMetadataValue, MetadataMap};
use tonic::server::{Grpc, StreamingService, UnaryService};
use tonic::{Request, Response, Status, Streaming};

use crate::auth::Authenticator;
use crate::codec::RawCodec;
use crate::coordinator::{transaction_status, Coordinator, Destination, Finalizer};
use crate::nodes::{Node, NodeSet};
use crate::peeker::StreamPeeker;
use crate::proto::{
    methods, Empty, HealthCheckRequest, HealthCheckResponse, ServingStatus, StopTransactionRequest,
    VoteTransactionRequest, VoteTransactionResponse, VoteTransactionState,
};

/// Frames buffered per destination before the client stream is throttled.
const FRAME_BUFFER: usize = 16;

type FrameStream = BoxStream<'static, Result<Bytes, Status>>;

pub struct Proxy {
    coordinator: Coordinator,
    nodes: NodeSet,
    auth: Authenticator,
}

impl Proxy {
    pub fn new(coordinator: Coordinator, nodes: NodeSet, auth: Authenticator) -> Self {
        Self {
            coordinator,
            nodes,
            auth,
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// HTTP/2 service answering every gRPC method.
    pub fn into_router(self: Arc<Self>) -> axum::Router {
        axum::Router::new().fallback(dispatch).with_state(self)
    }

    async fn vote_transaction(
        &self,
        request: Request<VoteTransactionRequest>,
    ) -> Result<Response<VoteTransactionResponse>, Status> {
        self.auth.check(request.metadata())?;
        let request = request.into_inner();
        let transactions = self.coordinator.transactions();

        let state = match transactions.vote(
            request.transaction_id,
            &request.node,
            &request.reference_updates_hash,
        ) {
            Ok(()) => match transactions.collect(request.transaction_id, &request.node).await {
                Ok(VoteResult::Committed) => VoteTransactionState::Commit,
                Ok(VoteResult::Aborted | VoteResult::Cancelled) => VoteTransactionState::Abort,
                Ok(VoteResult::Stopped) => VoteTransactionState::Stop,
                Ok(VoteResult::Undecided) => {
                    return Err(Status::internal("vote collected without a decision"))
                }
                Err(err) => return Err(transaction_status(err)),
            },
            Err(TransactionError::Aborted | TransactionError::Cancelled) => VoteTransactionState::Abort,
            Err(TransactionError::Stopped) => VoteTransactionState::Stop,
            Err(err) => return Err(transaction_status(err)),
        };

        tracing::debug!(
            transaction_id = request.transaction_id,
            node = %request.node,
            state = ?state,
            "vote answered"
        );
        Ok(Response::new(VoteTransactionResponse {
            state: state as i32,
        }))
    }

    fn stop_transaction(&self, request: Request<StopTransactionRequest>) -> Result<Response<Empty>, Status> {
        self.auth.check(request.metadata())?;
        let request = request.into_inner();
        self.coordinator
            .transactions()
            .stop(request.transaction_id)
            .map_err(transaction_status)?;
        Ok(Response::new(Empty {}))
    }

    fn node(&self, virtual_storage: &str, destination: &Destination) -> Result<Node, Status> {
        self.nodes
            .node(virtual_storage, &destination.storage)
            .cloned()
    }

    async fn proxy_stream(
        &self,
        method: String,
        request: Request<Streaming<Bytes>>,
    ) -> Result<Response<FrameStream>, Status> {
        self.auth.check(request.metadata())?;
        let path = PathAndQuery::try_from(method.as_str())
            .map_err(|err| Status::invalid_argument(format!("invalid method path {method:?}: {err}")))?;
        let (metadata, _, frames) = request.into_parts();
        let mut frames = StreamPeeker::new(frames);
        let first = frames.peek().await?;

        let mut params = self.coordinator.route(&method, first).await?;
        let primary_node = self.node(&params.virtual_storage, &params.primary)?;
        let secondary_nodes = params
            .secondaries
            .iter()
            .map(|destination| self.node(&params.virtual_storage, destination))
            .collect::<Result<Vec<_>, Status>>()?;
        let primary_metadata = destination_metadata(&metadata, &params.primary)?;
        let secondary_metadata = params
            .secondaries
            .iter()
            .map(|destination| destination_metadata(&metadata, destination))
            .collect::<Result<Vec<_>, Status>>()?;

        tracing::debug!(
            method = %method,
            virtual_storage = %params.virtual_storage,
            primary = %params.primary.storage,
            secondaries = params.secondaries.len(),
            transaction_id = ?params.transaction_id(),
            "proxying call"
        );

        let (abort_tx, abort_rx) = watch::channel(false);
        let (primary_tx, primary_rx) = mpsc::channel(FRAME_BUFFER);
        let mut outgoing = vec![(primary_tx, params.primary.frame.clone())];
        let mut secondaries = Vec::with_capacity(secondary_nodes.len());
        for ((node, metadata), destination) in secondary_nodes
            .into_iter()
            .zip(secondary_metadata)
            .zip(&params.secondaries)
        {
            let (tx, rx) = mpsc::channel(FRAME_BUFFER);
            outgoing.push((tx, destination.frame.clone()));
            secondaries.push(spawn_secondary(
                node,
                path.clone(),
                metadata,
                ReceiverStream::new(rx),
                abort_rx.clone(),
            ));
        }
        tokio::spawn(pump(frames.skip(1), outgoing, abort_tx));

        let call = primary_node.streaming(path, primary_metadata, ReceiverStream::new(primary_rx));
        let primary = tokio::select! {
            response = call => response,
            _ = aborted(abort_rx.clone()) => Err(client_aborted()),
        };
        let settlement = Settlement {
            finalizer: params.finalizer.take(),
            secondaries,
        };

        let response = match primary {
            Ok(response) => response,
            Err(status) => {
                let _ = settlement.settle(Err(status.clone())).await;
                return Err(status);
            }
        };

        let response_metadata = response.metadata().clone();
        let mut upstream = response.into_inner();
        let (client_tx, client_rx) = mpsc::channel(FRAME_BUFFER);
        tokio::spawn(async move {
            let mut client_open = true;
            let outcome = loop {
                let next = tokio::select! {
                    next = upstream.next() => next,
                    _ = aborted(abort_rx.clone()) => Some(Err(client_aborted())),
                };
                match next {
                    Some(Ok(frame)) => {
                        if client_open && client_tx.send(Ok(frame)).await.is_err() {
                            // Keep draining so the backends finish and the
                            // finalizer still runs.
                            client_open = false;
                        }
                    }
                    Some(Err(status)) => break Err(status),
                    None => break Ok(()),
                }
            };
            if let Err(status) = settlement.settle(outcome).await {
                if client_open {
                    let _ = client_tx.send(Err(status)).await;
                }
            }
        });

        let mut response = Response::new(ReceiverStream::new(client_rx).boxed());
        *response.metadata_mut() = response_metadata;
        Ok(response)
    }
}

/// Everything that has to happen once the primary is done.
struct Settlement {
    finalizer: Option<Finalizer>,
    secondaries: Vec<JoinHandle<(String, bool)>>,
}

impl Settlement {
    /// Wait for the secondaries, then run the finalizer. The primary's error
    /// takes precedence over the finalizer's.
    async fn settle(mut self, primary: Result<(), Status>) -> Result<(), Status> {
        if primary.is_err() {
            if let Some(finalizer) = &mut self.finalizer {
                finalizer.cancel_transaction();
            }
        }

        let mut succeeded = BTreeSet::new();
        for handle in self.secondaries {
            match handle.await {
                Ok((storage, true)) => {
                    succeeded.insert(storage);
                }
                Ok((_, false)) => {}
                Err(err) => tracing::warn!(error = %err, "secondary forwarding task failed"),
            }
        }

        let finalized = match self.finalizer {
            Some(finalizer) => finalizer.finish(primary.is_ok(), &succeeded).await,
            None => Ok(()),
        };
        primary?;
        finalized
    }
}

async fn aborted(mut abort: watch::Receiver<bool>) {
    while !*abort.borrow_and_update() {
        if abort.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn client_aborted() -> Status {
    Status::cancelled("client request stream failed")
}

/// Copy the client stream to every destination. Each destination first gets
/// its own rewritten first frame. A failing client stream aborts all calls
/// instead of half-closing them.
async fn pump<S>(mut upstream: S, destinations: Vec<(mpsc::Sender<Bytes>, Bytes)>, abort: watch::Sender<bool>)
where
    S: Stream<Item = Result<Bytes, Status>> + Unpin,
{
    let mut senders = Vec::with_capacity(destinations.len());
    for (tx, first) in destinations {
        if tx.send(first).await.is_ok() {
            senders.push(tx);
        }
    }
    while let Some(frame) = upstream.next().await {
        match frame {
            Ok(frame) => {
                let mut open = Vec::with_capacity(senders.len());
                for tx in senders {
                    if tx.send(frame.clone()).await.is_ok() {
                        open.push(tx);
                    }
                }
                senders = open;
            }
            Err(status) => {
                tracing::debug!(error = %status, "client request stream failed");
                let _ = abort.send(true);
                return;
            }
        }
    }
}

fn spawn_secondary(
    node: Node,
    path: PathAndQuery,
    metadata: MetadataMap,
    frames: ReceiverStream<Bytes>,
    abort: watch::Receiver<bool>,
) -> JoinHandle<(String, bool)> {
    tokio::spawn(async move {
        let call = async {
            let mut responses = node.streaming(path, metadata, frames).await?.into_inner();
            while let Some(frame) = responses.next().await {
                frame?;
            }
            Ok::<(), Status>(())
        };
        let result = tokio::select! {
            result = call => result,
            _ = aborted(abort) => Err(client_aborted()),
        };
        if let Err(status) = &result {
            tracing::warn!(
                virtual_storage = %node.virtual_storage(),
                storage = %node.storage(),
                code = ?status.code(),
                error = %status.message(),
                "secondary call failed"
            );
        }
        (node.storage().to_string(), result.is_ok())
    })
}

fn destination_metadata(base: &MetadataMap, destination: &Destination) -> Result<MetadataMap, Status> {
    let mut metadata = base.clone();
    metadata.remove("authorization");
    for (key, value) in &destination.headers {
        let value = AsciiMetadataValue::try_from(value.as_str())
            .map_err(|err| Status::internal(format!("invalid {key} header: {err}")))?;
        metadata.insert(*key, value);
    }
    Ok(metadata)
}

struct ProxyCall {
    proxy: Arc<Proxy>,
    method: String,
}

impl StreamingService<Bytes> for ProxyCall {
    type Response = Bytes;
    type ResponseStream = FrameStream;
    type Future = BoxFuture<'static, Result<Response<FrameStream>, Status>>;

    fn call(&mut self, request: Request<Streaming<Bytes>>) -> Self::Future {
        let proxy = self.proxy.clone();
        let method = std::mem::take(&mut self.method);
        Box::pin(async move { proxy.proxy_stream(method, request).await })
    }
}

struct VoteService(Arc<Proxy>);

impl UnaryService<VoteTransactionRequest> for VoteService {
    type Response = VoteTransactionResponse;
    type Future = BoxFuture<'static, Result<Response<VoteTransactionResponse>, Status>>;

    fn call(&mut self, request: Request<VoteTransactionRequest>) -> Self::Future {
        let proxy = self.0.clone();
        Box::pin(async move { proxy.vote_transaction(request).await })
    }
}

struct StopService(Arc<Proxy>);

impl UnaryService<StopTransactionRequest> for StopService {
    type Response = Empty;
    type Future = BoxFuture<'static, Result<Response<Empty>, Status>>;

    fn call(&mut self, request: Request<StopTransactionRequest>) -> Self::Future {
        let result = self.0.stop_transaction(request);
        Box::pin(async move { result })
    }
}

struct HealthService;

impl UnaryService<HealthCheckRequest> for HealthService {
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

async fn dispatch(State(proxy): State<Arc<Proxy>>, request: axum::extract::Request) -> axum::response::Response {
    let method = request.uri().path().to_string();
    let metrics = proxy.coordinator.metrics().clone();
    let response = match method.as_str() {
        methods::VOTE_TRANSACTION => {
            metrics.record_local_rpc();
            Grpc::new(ProstCodec::<VoteTransactionResponse, VoteTransactionRequest>::default())
                .unary(VoteService(proxy), request)
                .await
        }
        methods::STOP_TRANSACTION => {
            metrics.record_local_rpc();
            Grpc::new(ProstCodec::<Empty, StopTransactionRequest>::default())
                .unary(StopService(proxy), request)
                .await
        }
        methods::HEALTH_CHECK => {
            metrics.record_local_rpc();
            Grpc::new(ProstCodec::<HealthCheckResponse, HealthCheckRequest>::default())
                .unary(HealthService, request)
                .await
        }
        _ => {
            Grpc::new(RawCodec)
                .max_decoding_message_size(usize::MAX)
                .max_encoding_message_size(usize::MAX)
                .streaming(ProxyCall { proxy, method }, request)
                .await
        }
    };
    response.map(axum::body::Body::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_metadata_replaces_credentials_and_adds_headers() {
        let mut base = MetadataMap::new();
        base.insert("authorization", "Bearer client".parse().unwrap());
        base.insert("x-request-id", "abc".parse().unwrap());
        let destination = Destination {
            storage: "n2".to_string(),
            frame: Bytes::new(),
            headers: vec![
                ("transaction-id", "42".to_string()),
                ("transaction-voter-name", "n2".to_string()),
            ],
        };

        let metadata = destination_metadata(&base, &destination).unwrap();
        assert!(metadata.get("authorization").is_none());
        assert_eq!(metadata.get("x-request-id").unwrap(), "abc");
        assert_eq!(metadata.get("transaction-id").unwrap(), "42");
        assert_eq!(metadata.get("transaction-voter-name").unwrap(), "n2");
    }

    #[tokio::test]
    async fn pump_rewrites_first_frame_per_destination() {
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        let (abort, abort_rx) = watch::channel(false);
        let upstream = futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"second")),
            Ok(Bytes::from_static(b"third")),
        ]);
        pump(
            upstream,
            vec![
                (tx1, Bytes::from_static(b"first-a")),
                (tx2, Bytes::from_static(b"first-b")),
            ],
            abort,
        )
        .await;

        let mut a = Vec::new();
        while let Some(frame) = rx1.recv().await {
            a.push(frame);
        }
        let mut b = Vec::new();
        while let Some(frame) = rx2.recv().await {
            b.push(frame);
        }
        assert_eq!(a, vec!["first-a", "second", "third"]);
        assert_eq!(b, vec!["first-b", "second", "third"]);
        assert!(!*abort_rx.borrow());
    }

    #[tokio::test]
    async fn pump_aborts_on_client_error() {
        let (tx, mut rx) = mpsc::channel(8);
        let (abort, abort_rx) = watch::channel(false);
        let upstream = futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"second")),
            Err(Status::cancelled("gone")),
            Ok(Bytes::from_static(b"never")),
        ]);
        pump(upstream, vec![(tx, Bytes::from_static(b"first"))], abort).await;

        assert_eq!(rx.recv().await.unwrap(), "first");
        assert_eq!(rx.recv().await.unwrap(), "second");
        assert!(rx.recv().await.is_none());
        assert!(*abort_rx.borrow());
        aborted(abort_rx).await;
    }
}
