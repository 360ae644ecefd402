//! Messages the proxy builds or parses itself.
//!
//! Everything else passes through as opaque frames. Field numbers match the
//! storage service definitions.

/// Repository reference embedded in most requests.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct Repository {
    #[prost(string, tag = "1")]
    pub storage_name: String,
    #[prost(string, tag = "2")]
    pub relative_path: String,
    #[prost(string, tag = "3")]
    pub git_object_directory: String,
    #[prost(string, repeated, tag = "4")]
    pub git_alternate_object_directories: Vec<String>,
    #[prost(string, tag = "5")]
    pub gl_repository: String,
    #[prost(string, tag = "8")]
    pub gl_project_path: String,
}

impl Repository {
    pub fn new(storage_name: impl Into<String>, relative_path: impl Into<String>) -> Self {
        Self {
            storage_name: storage_name.into(),
            relative_path: relative_path.into(),
            ..Default::default()
        }
    }
}

/// Field number of `Repository.storage_name`.
pub const REPOSITORY_STORAGE_FIELD: u32 = 1;
/// Field number of `Repository.relative_path`.
pub const REPOSITORY_PATH_FIELD: u32 = 2;

#[derive(Clone, PartialEq, prost::Message)]
pub struct VoteTransactionRequest {
    #[prost(message, optional, tag = "1")]
    pub repository: Option<Repository>,
    #[prost(uint64, tag = "2")]
    pub transaction_id: u64,
    #[prost(string, tag = "3")]
    pub node: String,
    #[prost(bytes = "vec", tag = "4")]
    pub reference_updates_hash: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum VoteTransactionState {
    Commit = 0,
    Abort = 1,
    Stop = 2,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VoteTransactionResponse {
    #[prost(enumeration = "VoteTransactionState", tag = "1")]
    pub state: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StopTransactionRequest {
    #[prost(message, optional, tag = "1")]
    pub repository: Option<Repository>,
    #[prost(uint64, tag = "2")]
    pub transaction_id: u64,
}

/// Response type for calls whose reply carries no fields.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Empty {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HealthCheckRequest {
    #[prost(string, tag = "1")]
    pub service: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ServingStatus {
    Unknown = 0,
    Serving = 1,
    NotServing = 2,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HealthCheckResponse {
    #[prost(enumeration = "ServingStatus", tag = "1")]
    pub status: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReplicateRepositoryRequest {
    #[prost(message, optional, tag = "1")]
    pub repository: Option<Repository>,
    #[prost(message, optional, tag = "2")]
    pub source: Option<Repository>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RemoveRepositoryRequest {
    #[prost(message, optional, tag = "1")]
    pub repository: Option<Repository>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RenameRepositoryRequest {
    #[prost(message, optional, tag = "1")]
    pub repository: Option<Repository>,
    #[prost(string, tag = "2")]
    pub relative_path: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GarbageCollectRequest {
    #[prost(message, optional, tag = "1")]
    pub repository: Option<Repository>,
    #[prost(bool, tag = "2")]
    pub create_bitmap: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RepackFullRequest {
    #[prost(message, optional, tag = "1")]
    pub repository: Option<Repository>,
    #[prost(bool, tag = "2")]
    pub create_bitmap: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RepackIncrementalRequest {
    #[prost(message, optional, tag = "1")]
    pub repository: Option<Repository>,
}

/// Fully-qualified method names the proxy calls or serves itself.
pub mod methods {
    pub const VOTE_TRANSACTION: &str = "/gitaly.RefTransaction/VoteTransaction";
    pub const STOP_TRANSACTION: &str = "/gitaly.RefTransaction/StopTransaction";
    pub const HEALTH_CHECK: &str = "/grpc.health.v1.Health/Check";

    pub const REPLICATE_REPOSITORY: &str = "/gitaly.RepositoryService/ReplicateRepository";
    pub const REMOVE_REPOSITORY: &str = "/gitaly.RepositoryService/RemoveRepository";
    pub const RENAME_REPOSITORY: &str = "/gitaly.RepositoryService/RenameRepository";
    pub const GARBAGE_COLLECT: &str = "/gitaly.RepositoryService/GarbageCollect";
    pub const REPACK_FULL: &str = "/gitaly.RepositoryService/RepackFull";
    pub const REPACK_INCREMENTAL: &str = "/gitaly.RepositoryService/RepackIncremental";
}
