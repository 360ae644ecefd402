//! Routing decisions: which backends serve an RPC.

use std::collections::BTreeMap;
use std::sync::Arc;

use tonic::Status;

use crate::config::ConfiguredStorages;
use crate::datastore::{DatastoreError, RepositoryStore};
use crate::election::{shard_primaries, ElectionError, PrimaryGetter};
use crate::health::HealthChecker;
use crate::random::Rand;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("virtual storage {0:?} does not exist")]
    UnknownVirtualStorage(String),
    #[error("no healthy nodes in virtual storage {0:?}")]
    NoHealthyNodes(String),
    #[error("no suitable node to serve {virtual_storage}/{relative_path}")]
    NoSuitableNode {
        virtual_storage: String,
        relative_path: String,
    },
    #[error("primary {0:?} is unhealthy")]
    PrimaryUnhealthy(String),
    #[error("repository {virtual_storage}/{relative_path} is read-only")]
    ReadOnly {
        virtual_storage: String,
        relative_path: String,
    },
    #[error("primary {primary:?} is not assigned to {virtual_storage}/{relative_path}")]
    PrimaryUnassigned {
        virtual_storage: String,
        relative_path: String,
        primary: String,
    },
    #[error("datastore error: {0}")]
    Datastore(#[from] DatastoreError),
}

impl From<RouterError> for Status {
    fn from(err: RouterError) -> Self {
        let message = err.to_string();
        match err {
            RouterError::UnknownVirtualStorage(_) => Status::invalid_argument(message),
            RouterError::NoHealthyNodes(_)
            | RouterError::NoSuitableNode { .. }
            | RouterError::PrimaryUnhealthy(_) => Status::unavailable(message),
            RouterError::ReadOnly { .. } => Status::failed_precondition(message),
            RouterError::PrimaryUnassigned { .. } | RouterError::Datastore(_) => {
                Status::internal(message)
            }
        }
    }
}

/// Where a repository-scoped mutator goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryMutatorRoute {
    pub primary: String,
    /// Healthy, consistent secondaries that take part in the vote.
    pub secondaries: Vec<String>,
    /// Assigned storages that catch up through replication afterwards.
    pub replication_targets: Vec<String>,
}

impl RepositoryMutatorRoute {
    pub fn participants(&self) -> Vec<String> {
        std::iter::once(self.primary.clone())
            .chain(self.secondaries.iter().cloned())
            .collect()
    }
}

/// Where a storage-scoped mutator goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageMutatorRoute {
    pub primary: String,
    pub secondaries: Vec<String>,
}

pub struct Router {
    storages: ConfiguredStorages,
    shard_primaries: BTreeMap<String, String>,
    health: Arc<dyn HealthChecker>,
    elector: Arc<dyn PrimaryGetter>,
    store: Arc<dyn RepositoryStore>,
    rand: Arc<Rand>,
}

impl Router {
    pub fn new(
        storages: ConfiguredStorages,
        default_primaries: &BTreeMap<String, String>,
        health: Arc<dyn HealthChecker>,
        elector: Arc<dyn PrimaryGetter>,
        store: Arc<dyn RepositoryStore>,
        rand: Arc<Rand>,
    ) -> Self {
        let shard_primaries = shard_primaries(&storages, default_primaries);
        Self {
            storages,
            shard_primaries,
            health,
            elector,
            store,
            rand,
        }
    }

    fn configured(&self, virtual_storage: &str) -> Result<&[String], RouterError> {
        self.storages
            .get(virtual_storage)
            .map(Vec::as_slice)
            .ok_or_else(|| RouterError::UnknownVirtualStorage(virtual_storage.to_string()))
    }

    /// Configured storages of `virtual_storage` that are healthy, in
    /// configuration order.
    fn healthy_storages(&self, virtual_storage: &str) -> Result<Vec<String>, RouterError> {
        let configured = self.configured(virtual_storage)?;
        let healthy = self.health.healthy();
        let storages: Vec<String> = configured
            .iter()
            .filter(|storage| healthy.contains(virtual_storage, storage))
            .cloned()
            .collect();
        if storages.is_empty() {
            return Err(RouterError::NoHealthyNodes(virtual_storage.to_string()));
        }
        Ok(storages)
    }

    async fn primary(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<Option<String>, RouterError> {
        match self.elector.primary(virtual_storage, relative_path).await {
            Ok(primary) => Ok(Some(primary)),
            Err(ElectionError::NoPrimary { .. }) => Ok(None),
            Err(ElectionError::UnknownVirtualStorage(vs)) => {
                Err(RouterError::UnknownVirtualStorage(vs))
            }
            Err(ElectionError::Datastore(err)) => Err(err.into()),
        }
    }

    /// A random healthy storage consistent with the primary. Without a
    /// primary any healthy storage on the latest generation qualifies.
    pub async fn route_repository_accessor(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<String, RouterError> {
        let healthy = self.healthy_storages(virtual_storage)?;

        let candidates: Vec<String> = match self.primary(virtual_storage, relative_path).await? {
            Some(primary) => {
                let consistent = self
                    .store
                    .consistent_secondaries(virtual_storage, relative_path, &primary)
                    .await?;
                healthy
                    .into_iter()
                    .filter(|storage| *storage == primary || consistent.contains(storage))
                    .collect()
            }
            None => {
                let mut latest = Vec::new();
                for storage in healthy {
                    if self
                        .store
                        .is_latest(virtual_storage, relative_path, &storage)
                        .await?
                    {
                        latest.push(storage);
                    }
                }
                latest
            }
        };

        self.rand
            .pick(&candidates)
            .cloned()
            .ok_or_else(|| RouterError::NoSuitableNode {
                virtual_storage: virtual_storage.to_string(),
                relative_path: relative_path.to_string(),
            })
    }

    /// The primary plus every assigned storage. Healthy secondaries on the
    /// primary's generation vote along, the rest replicate afterwards.
    pub async fn route_repository_mutator(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<RepositoryMutatorRoute, RouterError> {
        let configured = self.configured(virtual_storage)?;
        let healthy_storages = self.healthy_storages(virtual_storage)?;
        let read_only = || RouterError::ReadOnly {
            virtual_storage: virtual_storage.to_string(),
            relative_path: relative_path.to_string(),
        };

        let primary = self
            .primary(virtual_storage, relative_path)
            .await?
            .ok_or_else(read_only)?;
        if !healthy_storages.contains(&primary) {
            return Err(RouterError::PrimaryUnhealthy(primary));
        }
        if !self
            .store
            .is_latest(virtual_storage, relative_path, &primary)
            .await?
        {
            return Err(read_only());
        }

        let assigned = self
            .store
            .host_assignments(virtual_storage, relative_path)
            .await?;
        if !assigned.contains(&primary) {
            return Err(RouterError::PrimaryUnassigned {
                virtual_storage: virtual_storage.to_string(),
                relative_path: relative_path.to_string(),
                primary,
            });
        }

        let consistent = self
            .store
            .consistent_secondaries(virtual_storage, relative_path, &primary)
            .await?;

        let mut secondaries = Vec::new();
        let mut replication_targets = Vec::new();
        for storage in configured {
            if *storage == primary || !assigned.contains(storage) {
                continue;
            }
            if healthy_storages.contains(storage) && consistent.contains(storage) {
                secondaries.push(storage.clone());
            } else {
                replication_targets.push(storage.clone());
            }
        }

        Ok(RepositoryMutatorRoute {
            primary,
            secondaries,
            replication_targets,
        })
    }

    pub fn route_storage_accessor(&self, virtual_storage: &str) -> Result<String, RouterError> {
        let healthy = self.healthy_storages(virtual_storage)?;
        self.rand
            .pick(&healthy)
            .cloned()
            .ok_or_else(|| RouterError::NoHealthyNodes(virtual_storage.to_string()))
    }

    /// The virtual storage's default primary and its healthy secondaries.
    pub fn route_storage_mutator(
        &self,
        virtual_storage: &str,
    ) -> Result<StorageMutatorRoute, RouterError> {
        let healthy = self.healthy_storages(virtual_storage)?;
        let primary = self
            .shard_primaries
            .get(virtual_storage)
            .cloned()
            .ok_or_else(|| RouterError::UnknownVirtualStorage(virtual_storage.to_string()))?;
        if !healthy.contains(&primary) {
            return Err(RouterError::PrimaryUnhealthy(primary));
        }
        let secondaries = healthy
            .into_iter()
            .filter(|storage| *storage != primary)
            .collect();
        Ok(StorageMutatorRoute {
            primary,
            secondaries,
        })
    }

    /// Any healthy storage of any virtual storage, as (virtual storage, storage).
    pub fn route_server(&self) -> Result<(String, String), RouterError> {
        let snapshot = self.health.healthy();
        let healthy = snapshot.as_ref();
        let candidates: Vec<(String, String)> = self
            .storages
            .iter()
            .flat_map(|(virtual_storage, storages)| {
                storages
                    .iter()
                    .filter(move |storage| healthy.contains(virtual_storage, storage))
                    .map(move |storage| (virtual_storage.clone(), storage.clone()))
            })
            .collect();
        self.rand
            .pick(&candidates)
            .cloned()
            .ok_or_else(|| RouterError::NoHealthyNodes("*".to_string()))
    }
}
