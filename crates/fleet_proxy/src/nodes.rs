//! Connections to the storage backends.
//!
//! One lazily dialed gRPC channel per configured (virtual storage, storage).
//! Channels reconnect on their own and are shared by every concurrent stream.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use http::uri::PathAndQuery;
use tonic::codec::{ProstCodec, Streaming};
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};

use crate::auth::v2_token;
use crate::codec::RawCodec;
use crate::config::Config;
use crate::health::Prober;
use crate::proto::{methods, HealthCheckRequest, HealthCheckResponse, ServingStatus};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Accepts `tcp://host:port`, `http://host:port` or a bare `host:port`.
pub fn endpoint_uri(address: &str) -> String {
    if let Some(rest) = address.strip_prefix("tcp://") {
        return format!("http://{rest}");
    }
    if address.starts_with("http://") || address.starts_with("https://") {
        return address.to_string();
    }
    format!("http://{address}")
}

#[derive(Clone)]
pub struct Node {
    virtual_storage: String,
    storage: String,
    address: String,
    token: String,
    channel: Channel,
}

impl Node {
    pub fn new(
        virtual_storage: impl Into<String>,
        storage: impl Into<String>,
        address: impl Into<String>,
        token: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let address = address.into();
        let channel = Endpoint::from_shared(endpoint_uri(&address))
            .with_context(|| format!("invalid node address {address:?}"))?
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_nodelay(true)
            .connect_lazy();
        Ok(Self {
            virtual_storage: virtual_storage.into(),
            storage: storage.into(),
            address,
            token: token.into(),
            channel,
        })
    }

    pub fn virtual_storage(&self) -> &str {
        &self.virtual_storage
    }

    pub fn storage(&self) -> &str {
        &self.storage
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Set a fresh bearer token for this node, if it has one.
    pub fn authorize(&self, metadata: &mut MetadataMap) -> Result<(), Status> {
        if self.token.is_empty() {
            return Ok(());
        }
        let token = v2_token(&self.token, SystemTime::now())?;
        let value = MetadataValue::try_from(format!("Bearer {token}"))
            .map_err(|err| Status::internal(format!("invalid authorization header: {err}")))?;
        metadata.insert("authorization", value);
        Ok(())
    }

    async fn client(&self) -> Result<tonic::client::Grpc<Channel>, Status> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone()).max_decoding_message_size(usize::MAX);
        grpc.ready().await.map_err(|err| {
            Status::unavailable(format!("storage {} is not reachable: {err}", self.storage))
        })?;
        Ok(grpc)
    }

    /// Call a unary method with typed messages.
    pub async fn unary<Req, Resp>(&self, method: &'static str, mut request: Request<Req>) -> Result<Resp, Status>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        self.authorize(request.metadata_mut())?;
        let mut grpc = self.client().await?;
        let response = grpc
            .unary(request, PathAndQuery::from_static(method), ProstCodec::<Req, Resp>::default())
            .await?;
        Ok(response.into_inner())
    }

    /// Open a raw bidirectional stream. `metadata` is sent as is, apart from
    /// the authorization header.
    pub async fn streaming<S>(
        &self,
        path: PathAndQuery,
        mut metadata: MetadataMap,
        frames: S,
    ) -> Result<Response<Streaming<Bytes>>, Status>
    where
        S: Stream<Item = Bytes> + Send + 'static,
    {
        self.authorize(&mut metadata)?;
        let request = Request::from_parts(metadata, Default::default(), frames);
        let mut grpc = self.client().await?;
        grpc.streaming(request, path, RawCodec).await
    }
}

/// Every configured backend, by virtual storage and storage.
#[derive(Clone)]
pub struct NodeSet {
    nodes: BTreeMap<(String, String), Node>,
}

impl NodeSet {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut nodes = BTreeMap::new();
        for virtual_storage in &config.virtual_storages {
            for node in &virtual_storage.nodes {
                let connection = Node::new(
                    &virtual_storage.name,
                    &node.storage,
                    &node.address,
                    &node.token,
                )?;
                tracing::debug!(
                    virtual_storage = %virtual_storage.name,
                    storage = %node.storage,
                    address = %node.address,
                    "configured backend"
                );
                nodes.insert(
                    (virtual_storage.name.clone(), node.storage.clone()),
                    connection,
                );
            }
        }
        Ok(Self { nodes })
    }

    pub fn node(&self, virtual_storage: &str, storage: &str) -> Result<&Node, Status> {
        self.nodes
            .get(&(virtual_storage.to_string(), storage.to_string()))
            .ok_or_else(|| {
                Status::internal(format!(
                    "unknown storage {storage:?} in virtual storage {virtual_storage:?}"
                ))
            })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[async_trait]
impl Prober for NodeSet {
    async fn probe(&self, virtual_storage: &str, storage: &str) -> Result<bool, Status> {
        let response: HealthCheckResponse = self
            .node(virtual_storage, storage)?
            .unary(
                methods::HEALTH_CHECK,
                Request::new(HealthCheckRequest {
                    service: String::new(),
                }),
            )
            .await?;
        Ok(response.status == ServingStatus::Serving as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::verify_token;

    #[test]
    fn addresses_normalize_to_http() {
        assert_eq!(endpoint_uri("tcp://10.0.0.1:8075"), "http://10.0.0.1:8075");
        assert_eq!(endpoint_uri("http://gitaly-1:8075"), "http://gitaly-1:8075");
        assert_eq!(endpoint_uri("gitaly-1:8075"), "http://gitaly-1:8075");
    }

    #[tokio::test]
    async fn authorize_adds_v2_token() {
        let node = Node::new("vs", "n1", "tcp://127.0.0.1:1", "secret").unwrap();
        let mut metadata = MetadataMap::new();
        node.authorize(&mut metadata).unwrap();
        let header = metadata.get("authorization").unwrap().to_str().unwrap();
        let token = header.strip_prefix("Bearer ").unwrap();
        verify_token("secret", token, SystemTime::now()).unwrap();

        let anonymous = Node::new("vs", "n2", "127.0.0.1:1", "").unwrap();
        let mut metadata = MetadataMap::new();
        anonymous.authorize(&mut metadata).unwrap();
        assert!(metadata.get("authorization").is_none());
    }

    #[tokio::test]
    async fn unknown_storage_is_internal() {
        let config = Config::from_toml_str(
            r#"
            [[virtual_storage]]
            name = "vs"
            [[virtual_storage.node]]
            storage = "n1"
            address = "tcp://127.0.0.1:1"
            "#,
        )
        .unwrap();
        let nodes = NodeSet::from_config(&config).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes.node("vs", "n1").unwrap().address(), "tcp://127.0.0.1:1");
        let err = nodes.node("vs", "n9").err().unwrap();
        assert_eq!(err.code(), tonic::Code::Internal);
    }
}
