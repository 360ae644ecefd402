//! Proxy configuration loaded from a TOML file.
//!
//! Timeouts and intervals are written in milliseconds in the file and exposed
//! as [`Duration`] accessors so the rest of the crate never deals with raw
//! integers.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::protoregistry::{OpType, Scope};

/// Storages configured per virtual storage, in configuration order.
pub type ConfiguredStorages = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Name this instance reports health under. Defaults to `listen_addr`.
    #[serde(default)]
    pub instance_name: Option<String>,
    /// Address backends should dial back to cast votes.
    #[serde(default)]
    pub transaction_callback_address: Option<String>,
    #[serde(default = "default_metrics_log_interval_ms")]
    pub metrics_log_interval_ms: u64,
    #[serde(rename = "virtual_storage", default)]
    pub virtual_storages: Vec<VirtualStorageConfig>,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub transactions: TransactionConfig,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    /// Annotations for methods missing from the built-in catalog.
    #[serde(rename = "method", default)]
    pub methods: Vec<MethodConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualStorageConfig {
    pub name: String,
    #[serde(rename = "node", default)]
    pub nodes: Vec<NodeConfig>,
}

impl VirtualStorageConfig {
    /// The storage flagged as `default_primary`, falling back to the first node.
    pub fn default_primary(&self) -> Option<&str> {
        self.nodes
            .iter()
            .find(|node| node.default_primary)
            .or_else(|| self.nodes.first())
            .map(|node| node.storage.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub storage: String,
    pub address: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub default_primary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ElectionStrategy {
    PerRepository,
    Disabled,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FailoverConfig {
    pub enabled: bool,
    pub election_strategy: ElectionStrategy,
    pub health_check_interval_ms: u64,
    pub health_check_timeout_ms: u64,
    pub healthiness_timeout_ms: u64,
    pub participant_timeout_ms: u64,
    pub election_interval_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            election_strategy: ElectionStrategy::PerRepository,
            health_check_interval_ms: 3_000,
            health_check_timeout_ms: 1_000,
            healthiness_timeout_ms: 10_000,
            participant_timeout_ms: 60_000,
            election_interval_ms: 10_000,
        }
    }
}

impl FailoverConfig {
    /// Per-repository election only runs when failover is enabled and the
    /// strategy asks for it.
    pub fn per_repository(&self) -> bool {
        self.enabled && self.election_strategy == ElectionStrategy::PerRepository
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn healthiness_timeout(&self) -> Duration {
        Duration::from_millis(self.healthiness_timeout_ms)
    }

    pub fn participant_timeout(&self) -> Duration {
        Duration::from_millis(self.participant_timeout_ms)
    }

    pub fn election_interval(&self) -> Duration {
        Duration::from_millis(self.election_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// Shared secret clients must present. Empty disables authentication.
    pub token: String,
    /// Log authentication failures instead of rejecting the call.
    pub transitioning: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicationConfig {
    pub batch_size: usize,
    pub parallel_storage_processing_workers: usize,
    pub max_attempts: u32,
    pub job_timeout_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            parallel_storage_processing_workers: 1,
            max_attempts: 3,
            job_timeout_ms: 60_000,
            backoff_initial_ms: 100,
            backoff_max_ms: 2_000,
        }
    }
}

impl ReplicationConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconciliationConfig {
    /// Zero disables periodic reconciliation.
    pub scheduling_interval_ms: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            scheduling_interval_ms: 300_000,
        }
    }
}

impl ReconciliationConfig {
    pub fn scheduling_interval(&self) -> Option<Duration> {
        (self.scheduling_interval_ms > 0).then(|| Duration::from_millis(self.scheduling_interval_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransactionConfig {
    /// Upper bound on how long a voter waits for quorum. Zero means no bound
    /// besides the RPC itself.
    pub vote_timeout_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            vote_timeout_ms: 60_000,
        }
    }
}

impl TransactionConfig {
    pub fn vote_timeout(&self) -> Option<Duration> {
        (self.vote_timeout_ms > 0).then(|| Duration::from_millis(self.vote_timeout_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Annotation for a method that is not part of the built-in catalog.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MethodConfig {
    /// Fully-qualified name, `/package.Service/Method`.
    pub name: String,
    pub operation: OpType,
    pub scope: Scope,
    #[serde(default)]
    pub target_repository_field: Option<String>,
    #[serde(default)]
    pub additional_repository_field: Option<String>,
    #[serde(default)]
    pub target_storage_field: Option<String>,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 2305))
}

fn default_metrics_log_interval_ms() -> u64 {
    60_000
}

fn default_max_connections() -> u32 {
    10
}

impl Config {
    /// Read, parse and validate the configuration file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(contents).context("failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.virtual_storages.is_empty() {
            bail!("at least one virtual storage must be configured");
        }

        let mut names = BTreeSet::new();
        for vs in &self.virtual_storages {
            if vs.name.trim().is_empty() {
                bail!("virtual storage name must not be empty");
            }
            if !names.insert(vs.name.as_str()) {
                bail!("virtual storage {:?} is configured more than once", vs.name);
            }
            if vs.nodes.is_empty() {
                bail!("virtual storage {:?} has no nodes", vs.name);
            }

            let mut storages = BTreeSet::new();
            for node in &vs.nodes {
                if node.storage.trim().is_empty() {
                    bail!("virtual storage {:?} has a node without a storage name", vs.name);
                }
                if node.address.trim().is_empty() {
                    bail!(
                        "storage {:?} in virtual storage {:?} has no address",
                        node.storage,
                        vs.name
                    );
                }
                if !storages.insert(node.storage.as_str()) {
                    bail!(
                        "storage {:?} is configured more than once in virtual storage {:?}",
                        node.storage,
                        vs.name
                    );
                }
            }

            let defaults = vs.nodes.iter().filter(|node| node.default_primary).count();
            if defaults > 1 {
                bail!(
                    "virtual storage {:?} has {defaults} default primaries, at most one is allowed",
                    vs.name
                );
            }
        }

        let failover = &self.failover;
        for (name, value) in [
            ("failover.health_check_interval_ms", failover.health_check_interval_ms),
            ("failover.health_check_timeout_ms", failover.health_check_timeout_ms),
            ("failover.healthiness_timeout_ms", failover.healthiness_timeout_ms),
            ("failover.participant_timeout_ms", failover.participant_timeout_ms),
            ("failover.election_interval_ms", failover.election_interval_ms),
            ("replication.job_timeout_ms", self.replication.job_timeout_ms),
            ("replication.backoff_initial_ms", self.replication.backoff_initial_ms),
            ("replication.backoff_max_ms", self.replication.backoff_max_ms),
        ] {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
        }
        if self.replication.batch_size == 0 {
            bail!("replication.batch_size must be greater than zero");
        }
        if self.replication.parallel_storage_processing_workers == 0 {
            bail!("replication.parallel_storage_processing_workers must be greater than zero");
        }
        if self.replication.max_attempts == 0 {
            bail!("replication.max_attempts must be greater than zero");
        }
        if let Some(db) = &self.database {
            if db.url.trim().is_empty() {
                bail!("database.url must not be empty");
            }
        }
        Ok(())
    }

    pub fn instance_name(&self) -> String {
        self.instance_name
            .clone()
            .unwrap_or_else(|| self.listen_addr.to_string())
    }

    pub fn virtual_storage(&self, name: &str) -> Option<&VirtualStorageConfig> {
        self.virtual_storages.iter().find(|vs| vs.name == name)
    }

    pub fn storages(&self) -> ConfiguredStorages {
        self.virtual_storages
            .iter()
            .map(|vs| {
                (
                    vs.name.clone(),
                    vs.nodes.iter().map(|node| node.storage.clone()).collect(),
                )
            })
            .collect()
    }

    pub fn default_primaries(&self) -> BTreeMap<String, String> {
        self.virtual_storages
            .iter()
            .filter_map(|vs| {
                vs.default_primary()
                    .map(|primary| (vs.name.clone(), primary.to_string()))
            })
            .collect()
    }

    pub fn metrics_log_interval(&self) -> Option<Duration> {
        (self.metrics_log_interval_ms > 0)
            .then(|| Duration::from_millis(self.metrics_log_interval_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
listen_addr = "127.0.0.1:9999"

[[virtual_storage]]
name = "default"

[[virtual_storage.node]]
storage = "gitaly-1"
address = "tcp://127.0.0.1:8075"
token = "secret"

[[virtual_storage.node]]
storage = "gitaly-2"
address = "tcp://127.0.0.1:8076"
default_primary = true
"#;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9999".parse().unwrap());
        assert_eq!(config.instance_name(), "127.0.0.1:9999");
        assert!(config.failover.per_repository());
        assert_eq!(config.replication.batch_size, 10);
        assert!(config.database.is_none());
        assert_eq!(
            config.storages()["default"],
            vec!["gitaly-1".to_string(), "gitaly-2".to_string()]
        );
        assert_eq!(config.default_primaries()["default"], "gitaly-2");
        assert_eq!(
            config.failover.health_check_interval(),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn default_primary_falls_back_to_first_node() {
        let toml = MINIMAL.replace("default_primary = true", "");
        let config = Config::from_toml_str(&toml).unwrap();
        assert_eq!(config.default_primaries()["default"], "gitaly-1");
    }

    #[test]
    fn parses_sections_and_method_annotations() {
        let toml = format!(
            r#"{MINIMAL}
[failover]
election_strategy = "disabled"

[replication]
batch_size = 5
max_attempts = 7

[transactions]
vote_timeout_ms = 0

[database]
url = "postgres://localhost/fleet"

[[method]]
name = "/custom.Service/Mutate"
operation = "mutator"
scope = "repository"
target_repository_field = "1.1"
"#
        );
        let config = Config::from_toml_str(&toml).unwrap();
        assert!(!config.failover.per_repository());
        assert_eq!(config.replication.batch_size, 5);
        assert_eq!(config.replication.max_attempts, 7);
        assert_eq!(config.transactions.vote_timeout(), None);
        assert_eq!(config.database.as_ref().unwrap().max_connections, 10);
        assert_eq!(config.methods.len(), 1);
        assert_eq!(config.methods[0].operation, OpType::Mutator);
        assert_eq!(config.methods[0].scope, Scope::Repository);
    }

    #[test]
    fn rejects_invalid_configs() {
        let empty = "listen_addr = \"127.0.0.1:1\"\n";
        assert!(Config::from_toml_str(empty).is_err());

        let no_nodes = "[[virtual_storage]]\nname = \"a\"\n";
        assert!(Config::from_toml_str(no_nodes).is_err());

        let two_defaults = MINIMAL.replace("token = \"secret\"", "default_primary = true");
        let err = Config::from_toml_str(&two_defaults).unwrap_err();
        assert!(format!("{err:#}").contains("default primaries"));

        let duplicate = MINIMAL.replace("gitaly-2", "gitaly-1");
        assert!(Config::from_toml_str(&duplicate).is_err());

        let zero_timeout = format!("{MINIMAL}\n[failover]\nhealth_check_timeout_ms = 0\n");
        let err = Config::from_toml_str(&zero_timeout).unwrap_err();
        assert!(format!("{err:#}").contains("health_check_timeout_ms"));

        let unknown_key = format!("{MINIMAL}\n[auth]\npassword = \"x\"\n");
        assert!(Config::from_toml_str(&unknown_key).is_err());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.virtual_storages.len(), 1);

        let missing = dir.path().join("missing.toml");
        let err = Config::load(&missing).unwrap_err();
        assert!(format!("{err:#}").contains("failed to read"));
    }
}
