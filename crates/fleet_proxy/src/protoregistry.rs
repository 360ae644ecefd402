//! Method classification and request rewriting.
//!
//! Every proxied method carries an operation (accessor, mutator, maintenance)
//! and a scope (repository, storage, server). Repository-scoped methods name
//! the field path of their target `Repository` message, storage-scoped ones
//! the path of their storage-name string. Paths are dotted field numbers, so a
//! path through a `oneof` member simply names the member's field number.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::Deserialize;
use tonic::Status;

use crate::config::MethodConfig;
use crate::proto::{Repository, REPOSITORY_PATH_FIELD, REPOSITORY_STORAGE_FIELD};
use crate::protowire::{self, WireError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Accessor,
    Mutator,
    Maintenance,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Repository,
    Storage,
    Server,
}

/// Dotted protobuf field-number path, e.g. `1.2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath(Vec<u32>);

impl FieldPath {
    pub fn numbers(&self) -> &[u32] {
        &self.0
    }
}

impl FromStr for FieldPath {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let numbers = s
            .split('.')
            .map(|part| match part.trim().parse::<u32>() {
                Ok(0) | Err(_) => Err(format!("invalid field path {s:?}")),
                Ok(n) => Ok(n),
            })
            .collect::<Result<Vec<_>, _>>()?;
        if numbers.is_empty() {
            return Err(format!("invalid field path {s:?}"));
        }
        Ok(Self(numbers))
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, number) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(".")?;
            }
            write!(f, "{number}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("method {0} is not supported")]
    UnknownMethod(String),
    #[error("method {0} is registered more than once")]
    DuplicateMethod(String),
    #[error("method {0} has no usable operation type")]
    InvalidOpType(String),
    #[error("method {method} is missing its {field} annotation")]
    MissingAnnotation { method: String, field: &'static str },
    #[error("method {method}: {reason}")]
    InvalidFieldPath { method: String, reason: String },
    #[error("request for {0} has no target repository")]
    MissingTarget(String),
    #[error("request for {0} has no target storage")]
    MissingStorage(String),
    #[error("malformed request: {0}")]
    Wire(#[from] WireError),
}

impl From<RegistryError> for Status {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownMethod(_) => Status::unimplemented(err.to_string()),
            RegistryError::MissingTarget(_)
            | RegistryError::MissingStorage(_)
            | RegistryError::Wire(_) => Status::invalid_argument(err.to_string()),
            _ => Status::internal(err.to_string()),
        }
    }
}

/// Metadata of one proxied method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    name: String,
    operation: OpType,
    scope: Scope,
    target_repo: Option<FieldPath>,
    additional_repo: Option<FieldPath>,
    target_storage: Option<FieldPath>,
}

impl MethodInfo {
    /// Build and validate a method annotation.
    pub fn new(
        name: impl Into<String>,
        operation: OpType,
        scope: Scope,
        target_repo: Option<&str>,
        additional_repo: Option<&str>,
        target_storage: Option<&str>,
    ) -> Result<Self, RegistryError> {
        let name = name.into();
        let parse = |path: Option<&str>| -> Result<Option<FieldPath>, RegistryError> {
            path.map(|p| {
                p.parse().map_err(|reason| RegistryError::InvalidFieldPath {
                    method: name.clone(),
                    reason,
                })
            })
            .transpose()
        };
        let target_repo = parse(target_repo)?;
        let additional_repo = parse(additional_repo)?;
        let target_storage = parse(target_storage)?;

        if operation == OpType::Unknown {
            return Err(RegistryError::InvalidOpType(name));
        }
        match scope {
            Scope::Repository if target_repo.is_none() => {
                return Err(RegistryError::MissingAnnotation {
                    method: name,
                    field: "target_repository_field",
                })
            }
            Scope::Storage if target_storage.is_none() => {
                return Err(RegistryError::MissingAnnotation {
                    method: name,
                    field: "target_storage_field",
                })
            }
            _ => {}
        }
        if operation != OpType::Accessor && scope == Scope::Server {
            // A write must always name what it writes to.
            return Err(RegistryError::MissingAnnotation {
                method: name,
                field: "target_repository_field",
            });
        }

        Ok(Self {
            name,
            operation,
            scope,
            target_repo,
            additional_repo,
            target_storage,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operation(&self) -> OpType {
        self.operation
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn target_repo_path(&self) -> Option<&FieldPath> {
        self.target_repo.as_ref()
    }

    pub fn additional_repo_path(&self) -> Option<&FieldPath> {
        self.additional_repo.as_ref()
    }

    pub fn target_storage_path(&self) -> Option<&FieldPath> {
        self.target_storage.as_ref()
    }

    /// Validate `frame` and wrap it for reading and rewriting the annotated
    /// fields.
    pub fn decode_request(&self, frame: Bytes) -> Result<RequestFrame<'_>, RegistryError> {
        protowire::scan(&frame)?;
        Ok(RequestFrame { info: self, frame })
    }
}

/// A first request frame tied to its method annotation.
#[derive(Debug, Clone)]
pub struct RequestFrame<'a> {
    info: &'a MethodInfo,
    frame: Bytes,
}

impl RequestFrame<'_> {
    fn read_repository(&self, path: &FieldPath) -> Result<Option<Repository>, RegistryError> {
        if protowire::find_message(&self.frame, path.numbers())?.is_none() {
            return Ok(None);
        }
        let storage_name =
            protowire::read_string(&self.frame, path.numbers(), REPOSITORY_STORAGE_FIELD)?
                .unwrap_or_default();
        let relative_path =
            protowire::read_string(&self.frame, path.numbers(), REPOSITORY_PATH_FIELD)?
                .unwrap_or_default();
        Ok(Some(Repository::new(storage_name, relative_path)))
    }

    pub fn target_repo(&self) -> Result<Repository, RegistryError> {
        let missing = || RegistryError::MissingTarget(self.info.name.clone());
        let path = self.info.target_repo.as_ref().ok_or_else(missing)?;
        self.read_repository(path)?.ok_or_else(missing)
    }

    pub fn additional_repo(&self) -> Result<Option<Repository>, RegistryError> {
        match &self.info.additional_repo {
            Some(path) => self.read_repository(path),
            None => Ok(None),
        }
    }

    pub fn target_storage(&self) -> Result<String, RegistryError> {
        let missing = || RegistryError::MissingStorage(self.info.name.clone());
        let path = self.info.target_storage.as_ref().ok_or_else(missing)?;
        let (field, parent) = path.numbers().split_last().ok_or_else(missing)?;
        protowire::read_string(&self.frame, parent, *field)?.ok_or_else(missing)
    }

    /// Point the request at `storage`: the target (and additional) repository
    /// for repository-scoped methods, the storage field for storage-scoped
    /// ones. Server-scoped requests are left untouched.
    pub fn set_target_storage(&mut self, storage: &str) -> Result<(), RegistryError> {
        match self.info.scope {
            Scope::Repository => {
                if let Some(path) = &self.info.target_repo {
                    self.frame = protowire::rewrite_string(
                        &self.frame,
                        path.numbers(),
                        REPOSITORY_STORAGE_FIELD,
                        storage,
                    )?;
                }
                if let Some(path) = &self.info.additional_repo {
                    if protowire::find_message(&self.frame, path.numbers())?.is_some() {
                        self.frame = protowire::rewrite_string(
                            &self.frame,
                            path.numbers(),
                            REPOSITORY_STORAGE_FIELD,
                            storage,
                        )?;
                    }
                }
            }
            Scope::Storage => {
                if let Some(path) = &self.info.target_storage {
                    if let Some((field, parent)) = path.numbers().split_last() {
                        self.frame =
                            protowire::rewrite_string(&self.frame, parent, *field, storage)?;
                    }
                }
            }
            Scope::Server => {}
        }
        Ok(())
    }

    pub fn encode(self) -> Bytes {
        self.frame
    }
}

/// Built-in annotations: (method, operation, scope, target repo, additional repo, target storage).
type CatalogEntry = (
    &'static str,
    OpType,
    Scope,
    Option<&'static str>,
    Option<&'static str>,
    Option<&'static str>,
);

const CATALOG: &[CatalogEntry] = &[
    // Repository accessors.
    ("/gitaly.RepositoryService/RepositoryExists", OpType::Accessor, Scope::Repository, Some("1"), None, None),
    ("/gitaly.RepositoryService/RepositorySize", OpType::Accessor, Scope::Repository, Some("1"), None, None),
    ("/gitaly.RepositoryService/HasLocalBranches", OpType::Accessor, Scope::Repository, Some("1"), None, None),
    ("/gitaly.RepositoryService/GetArchive", OpType::Accessor, Scope::Repository, Some("1"), None, None),
    ("/gitaly.RepositoryService/FindMergeBase", OpType::Accessor, Scope::Repository, Some("1"), None, None),
    ("/gitaly.RefService/FindDefaultBranchName", OpType::Accessor, Scope::Repository, Some("1"), None, None),
    ("/gitaly.RefService/FindAllBranches", OpType::Accessor, Scope::Repository, Some("1"), None, None),
    ("/gitaly.RefService/FindLocalBranches", OpType::Accessor, Scope::Repository, Some("1"), None, None),
    ("/gitaly.RefService/RefExists", OpType::Accessor, Scope::Repository, Some("1"), None, None),
    ("/gitaly.RefService/ListRefs", OpType::Accessor, Scope::Repository, Some("1"), None, None),
    ("/gitaly.CommitService/FindCommit", OpType::Accessor, Scope::Repository, Some("1"), None, None),
    ("/gitaly.CommitService/CountCommits", OpType::Accessor, Scope::Repository, Some("1"), None, None),
    ("/gitaly.CommitService/ListCommits", OpType::Accessor, Scope::Repository, Some("1"), None, None),
    ("/gitaly.CommitService/TreeEntry", OpType::Accessor, Scope::Repository, Some("1"), None, None),
    ("/gitaly.BlobService/GetBlob", OpType::Accessor, Scope::Repository, Some("1"), None, None),
    ("/gitaly.SmartHTTPService/InfoRefsUploadPack", OpType::Accessor, Scope::Repository, Some("1"), None, None),
    ("/gitaly.SmartHTTPService/InfoRefsReceivePack", OpType::Accessor, Scope::Repository, Some("1"), None, None),
    ("/gitaly.SmartHTTPService/PostUploadPack", OpType::Accessor, Scope::Repository, Some("1"), None, None),
    ("/gitaly.SSHService/SSHUploadPack", OpType::Accessor, Scope::Repository, Some("1"), None, None),
    // Repository mutators.
    ("/gitaly.SmartHTTPService/PostReceivePack", OpType::Mutator, Scope::Repository, Some("1"), None, None),
    ("/gitaly.SSHService/SSHReceivePack", OpType::Mutator, Scope::Repository, Some("1"), None, None),
    ("/gitaly.RepositoryService/CreateRepository", OpType::Mutator, Scope::Repository, Some("1"), None, None),
    ("/gitaly.RepositoryService/CreateRepositoryFromURL", OpType::Mutator, Scope::Repository, Some("1"), None, None),
    ("/gitaly.RepositoryService/CreateRepositoryFromBundle", OpType::Mutator, Scope::Repository, Some("1"), None, None),
    ("/gitaly.RepositoryService/FetchRemote", OpType::Mutator, Scope::Repository, Some("1"), None, None),
    ("/gitaly.RepositoryService/WriteRef", OpType::Mutator, Scope::Repository, Some("1"), None, None),
    ("/gitaly.RepositoryService/RemoveRepository", OpType::Mutator, Scope::Repository, Some("1"), None, None),
    ("/gitaly.RepositoryService/RenameRepository", OpType::Mutator, Scope::Repository, Some("1"), None, None),
    ("/gitaly.RefService/DeleteRefs", OpType::Mutator, Scope::Repository, Some("1"), None, None),
    ("/gitaly.OperationService/UserCreateBranch", OpType::Mutator, Scope::Repository, Some("1"), None, None),
    ("/gitaly.OperationService/UserDeleteBranch", OpType::Mutator, Scope::Repository, Some("1"), None, None),
    ("/gitaly.OperationService/UserCreateTag", OpType::Mutator, Scope::Repository, Some("1"), None, None),
    // The repository sits in the `header` member of the request oneof.
    ("/gitaly.OperationService/UserCommitFiles", OpType::Mutator, Scope::Repository, Some("1.1"), None, None),
    ("/gitaly.OperationService/UserMergeBranch", OpType::Mutator, Scope::Repository, Some("1"), None, None),
    ("/gitaly.ObjectPoolService/LinkRepositoryToObjectPool", OpType::Mutator, Scope::Repository, Some("2"), Some("1.1"), None),
    // Maintenance.
    ("/gitaly.RepositoryService/GarbageCollect", OpType::Maintenance, Scope::Repository, Some("1"), None, None),
    ("/gitaly.RepositoryService/RepackFull", OpType::Maintenance, Scope::Repository, Some("1"), None, None),
    ("/gitaly.RepositoryService/RepackIncremental", OpType::Maintenance, Scope::Repository, Some("1"), None, None),
    ("/gitaly.RepositoryService/OptimizeRepository", OpType::Maintenance, Scope::Repository, Some("1"), None, None),
    ("/gitaly.RepositoryService/Cleanup", OpType::Maintenance, Scope::Repository, Some("1"), None, None),
    ("/gitaly.RepositoryService/WriteCommitGraph", OpType::Maintenance, Scope::Repository, Some("1"), None, None),
    ("/gitaly.RepositoryService/PruneUnreachableObjects", OpType::Maintenance, Scope::Repository, Some("1"), None, None),
    // Storage scoped.
    ("/gitaly.NamespaceService/AddNamespace", OpType::Mutator, Scope::Storage, None, None, Some("1")),
    ("/gitaly.NamespaceService/RemoveNamespace", OpType::Mutator, Scope::Storage, None, None, Some("1")),
    ("/gitaly.NamespaceService/RenameNamespace", OpType::Mutator, Scope::Storage, None, None, Some("1")),
    ("/gitaly.NamespaceService/NamespaceExists", OpType::Accessor, Scope::Storage, None, None, Some("1")),
    ("/gitaly.InternalGitaly/WalkRepos", OpType::Accessor, Scope::Storage, None, None, Some("1")),
    ("/gitaly.RemoteService/FindRemoteRepository", OpType::Accessor, Scope::Storage, None, None, Some("2")),
    // Server scoped.
    ("/gitaly.ServerService/ServerInfo", OpType::Accessor, Scope::Server, None, None, None),
    ("/gitaly.ServerService/DiskStatistics", OpType::Accessor, Scope::Server, None, None, None),
];

/// Read-only table of method annotations, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    methods: HashMap<String, MethodInfo>,
}

impl Registry {
    /// The built-in catalog.
    pub fn builtin() -> Result<Self, RegistryError> {
        let mut registry = Self::default();
        for (name, operation, scope, target_repo, additional_repo, target_storage) in CATALOG {
            registry.register(MethodInfo::new(
                *name,
                *operation,
                *scope,
                *target_repo,
                *additional_repo,
                *target_storage,
            )?)?;
        }
        Ok(registry)
    }

    /// The built-in catalog plus configured annotations. Configured entries
    /// override built-in ones with the same name.
    pub fn with_overrides(methods: &[MethodConfig]) -> Result<Self, RegistryError> {
        let mut registry = Self::builtin()?;
        let mut seen = std::collections::HashSet::new();
        for method in methods {
            if !seen.insert(method.name.as_str()) {
                return Err(RegistryError::DuplicateMethod(method.name.clone()));
            }
            let info = MethodInfo::new(
                method.name.clone(),
                method.operation,
                method.scope,
                method.target_repository_field.as_deref(),
                method.additional_repository_field.as_deref(),
                method.target_storage_field.as_deref(),
            )?;
            registry.methods.insert(info.name.clone(), info);
        }
        Ok(registry)
    }

    pub fn register(&mut self, info: MethodInfo) -> Result<(), RegistryError> {
        if self.methods.contains_key(&info.name) {
            return Err(RegistryError::DuplicateMethod(info.name));
        }
        self.methods.insert(info.name.clone(), info);
        Ok(())
    }

    pub fn lookup(&self, method: &str) -> Result<&MethodInfo, RegistryError> {
        self.methods
            .get(method)
            .ok_or_else(|| RegistryError::UnknownMethod(method.to_string()))
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{GarbageCollectRequest, RenameRepositoryRequest};
    use prost::Message;

    #[derive(Clone, PartialEq, prost::Message)]
    struct CommitHeader {
        #[prost(message, optional, tag = "1")]
        repository: Option<Repository>,
        #[prost(string, tag = "3")]
        branch_name: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct CommitFilesRequest {
        #[prost(oneof = "CommitPayload", tags = "1, 2")]
        payload: Option<CommitPayload>,
    }

    #[derive(Clone, PartialEq, prost::Oneof)]
    enum CommitPayload {
        #[prost(message, tag = "1")]
        Header(CommitHeader),
        #[prost(bytes, tag = "2")]
        Action(Vec<u8>),
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct NamespaceRequest {
        #[prost(string, tag = "1")]
        storage_name: String,
        #[prost(string, tag = "2")]
        name: String,
    }

    #[test]
    fn field_path_parsing() {
        assert_eq!("1.2".parse::<FieldPath>().unwrap().numbers(), &[1, 2]);
        assert_eq!("3".parse::<FieldPath>().unwrap().to_string(), "3");
        assert!("".parse::<FieldPath>().is_err());
        assert!("1.0".parse::<FieldPath>().is_err());
        assert!("a.b".parse::<FieldPath>().is_err());
    }

    #[test]
    fn builtin_catalog_is_valid() {
        let registry = Registry::builtin().unwrap();
        assert_eq!(registry.len(), CATALOG.len());
        let info = registry
            .lookup("/gitaly.SmartHTTPService/PostReceivePack")
            .unwrap();
        assert_eq!(info.operation(), OpType::Mutator);
        assert_eq!(info.scope(), Scope::Repository);
        assert_eq!(
            registry.lookup("/nope.Service/Nope"),
            Err(RegistryError::UnknownMethod("/nope.Service/Nope".into()))
        );
    }

    #[test]
    fn invalid_annotations_are_rejected() {
        assert_eq!(
            MethodInfo::new("/a.B/C", OpType::Unknown, Scope::Repository, Some("1"), None, None),
            Err(RegistryError::InvalidOpType("/a.B/C".into()))
        );
        assert!(matches!(
            MethodInfo::new("/a.B/C", OpType::Mutator, Scope::Repository, None, None, None),
            Err(RegistryError::MissingAnnotation { .. })
        ));
        assert!(matches!(
            MethodInfo::new("/a.B/C", OpType::Accessor, Scope::Storage, None, None, None),
            Err(RegistryError::MissingAnnotation { .. })
        ));
        assert!(matches!(
            MethodInfo::new("/a.B/C", OpType::Mutator, Scope::Server, None, None, None),
            Err(RegistryError::MissingAnnotation { .. })
        ));
        assert!(matches!(
            MethodInfo::new("/a.B/C", OpType::Accessor, Scope::Repository, Some("x"), None, None),
            Err(RegistryError::InvalidFieldPath { .. })
        ));
    }

    #[test]
    fn config_overrides_and_duplicates() {
        let custom = MethodConfig {
            name: "/custom.Service/Write".into(),
            operation: OpType::Mutator,
            scope: Scope::Repository,
            target_repository_field: Some("2".into()),
            additional_repository_field: None,
            target_storage_field: None,
        };
        let registry = Registry::with_overrides(std::slice::from_ref(&custom)).unwrap();
        assert_eq!(registry.len(), CATALOG.len() + 1);
        assert_eq!(
            registry
                .lookup("/custom.Service/Write")
                .unwrap()
                .target_repo_path()
                .unwrap()
                .numbers(),
            &[2]
        );

        let err = Registry::with_overrides(&[custom.clone(), custom]).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateMethod(_)));
    }

    #[test]
    fn reads_and_rewrites_repository_target() {
        let registry = Registry::builtin().unwrap();
        let info = registry
            .lookup("/gitaly.RepositoryService/RenameRepository")
            .unwrap();
        let request = RenameRepositoryRequest {
            repository: Some(Repository::new("praefect", "a/b.git")),
            relative_path: "c/d.git".into(),
        };
        let mut frame = info
            .decode_request(Bytes::from(request.encode_to_vec()))
            .unwrap();
        let repo = frame.target_repo().unwrap();
        assert_eq!(repo.storage_name, "praefect");
        assert_eq!(repo.relative_path, "a/b.git");

        frame.set_target_storage("gitaly-1").unwrap();
        let decoded = RenameRepositoryRequest::decode(frame.encode()).unwrap();
        assert_eq!(
            decoded,
            RenameRepositoryRequest {
                repository: Some(Repository::new("gitaly-1", "a/b.git")),
                relative_path: "c/d.git".into(),
            }
        );
    }

    #[test]
    fn descends_through_oneof_member() {
        let registry = Registry::builtin().unwrap();
        let info = registry
            .lookup("/gitaly.OperationService/UserCommitFiles")
            .unwrap();
        let request = CommitFilesRequest {
            payload: Some(CommitPayload::Header(CommitHeader {
                repository: Some(Repository::new("praefect", "r.git")),
                branch_name: "main".into(),
            })),
        };
        let mut frame = info
            .decode_request(Bytes::from(request.encode_to_vec()))
            .unwrap();
        assert_eq!(frame.target_repo().unwrap().relative_path, "r.git");
        frame.set_target_storage("gitaly-3").unwrap();
        let decoded = CommitFilesRequest::decode(frame.encode()).unwrap();
        match decoded.payload {
            Some(CommitPayload::Header(header)) => {
                assert_eq!(header.repository.unwrap().storage_name, "gitaly-3");
                assert_eq!(header.branch_name, "main");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn missing_target_is_invalid_argument() {
        let registry = Registry::builtin().unwrap();
        let info = registry
            .lookup("/gitaly.RepositoryService/GarbageCollect")
            .unwrap();
        let request = GarbageCollectRequest {
            repository: None,
            create_bitmap: true,
        };
        let frame = info
            .decode_request(Bytes::from(request.encode_to_vec()))
            .unwrap();
        let err = frame.target_repo().unwrap_err();
        assert_eq!(Status::from(err).code(), tonic::Code::InvalidArgument);

        let garbage = info.decode_request(Bytes::from_static(&[0x0a, 0x09]));
        assert!(matches!(garbage, Err(RegistryError::Wire(_))));
    }

    #[test]
    fn rewrites_storage_scoped_field() {
        let registry = Registry::builtin().unwrap();
        let info = registry
            .lookup("/gitaly.NamespaceService/AddNamespace")
            .unwrap();
        let request = NamespaceRequest {
            storage_name: "praefect".into(),
            name: "group".into(),
        };
        let mut frame = info
            .decode_request(Bytes::from(request.encode_to_vec()))
            .unwrap();
        assert_eq!(frame.target_storage().unwrap(), "praefect");
        frame.set_target_storage("gitaly-2").unwrap();
        let decoded = NamespaceRequest::decode(frame.encode()).unwrap();
        assert_eq!(decoded.storage_name, "gitaly-2");
        assert_eq!(decoded.name, "group");
    }
}
