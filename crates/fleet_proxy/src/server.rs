//! Process wiring: datastore, health, election, routing, background loops
//! and the gRPC listener.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use fleet_voting::voting::TransactionManager;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use crate::auth::Authenticator;
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::datastore::{Datastore, DatastoreError, PostgresStore};
use crate::election::{PerRepositoryElector, PrimaryGetter, StaticElector};
use crate::health::{HealthChecker, HealthManager, HealthManagerConfig, StaticHealthChecker};
use crate::metrics::{spawn_metrics_logger, ProxyMetrics};
use crate::nodes::NodeSet;
use crate::protoregistry::Registry;
use crate::proxy::Proxy;
use crate::random::Rand;
use crate::reconciler::Reconciler;
use crate::replicator::{GrpcReplicator, ReplicationManager, ReplicationManagerConfig};
use crate::router::Router;

/// PostgreSQL when `[database]` is configured, in-memory otherwise.
pub async fn open_datastore(config: &Config) -> Result<Datastore, DatastoreError> {
    let max_attempts = config.replication.max_attempts;
    match &config.database {
        Some(database) => {
            let store = PostgresStore::connect(
                &database.url,
                database.max_connections,
                config.storages(),
                max_attempts,
            )
            .await?;
            Ok(Datastore::postgres(Arc::new(store)))
        }
        None => {
            tracing::warn!("no database configured, state is kept in memory and lost on restart");
            Ok(Datastore::memory(config.storages(), max_attempts))
        }
    }
}

/// A fully wired proxy, ready to serve.
pub struct App {
    config: Config,
    datastore: Datastore,
    nodes: NodeSet,
    metrics: Arc<ProxyMetrics>,
    rand: Arc<Rand>,
    health: Arc<dyn HealthChecker>,
    health_manager: Option<Arc<HealthManager>>,
    elector: Option<Arc<PerRepositoryElector>>,
    failover_lock: Arc<RwLock<()>>,
    proxy: Arc<Proxy>,
}

impl App {
    pub fn build(config: Config, datastore: Datastore) -> anyhow::Result<Self> {
        let storages = config.storages();
        let default_primaries = config.default_primaries();
        let nodes = NodeSet::from_config(&config).context("configure backend connections")?;
        let metrics = Arc::new(ProxyMetrics::default());
        let rand = Arc::new(Rand::new());

        let health_manager = config.failover.per_repository().then(|| {
            Arc::new(HealthManager::new(
                config.instance_name(),
                storages.clone(),
                Arc::new(nodes.clone()),
                datastore.health.clone(),
                metrics.clone(),
                HealthManagerConfig {
                    interval: config.failover.health_check_interval(),
                    probe_timeout: config.failover.health_check_timeout(),
                    participant_timeout: config.failover.participant_timeout(),
                    healthiness_timeout: config.failover.healthiness_timeout(),
                },
            ))
        });
        let health: Arc<dyn HealthChecker> = match &health_manager {
            Some(manager) => manager.clone(),
            None => Arc::new(StaticHealthChecker::new(&storages)),
        };

        let elector = health_manager.is_some().then(|| {
            Arc::new(PerRepositoryElector::new(
                storages.clone(),
                default_primaries.clone(),
                datastore.repositories.clone(),
                health.clone(),
                rand.clone(),
                metrics.clone(),
            ))
        });
        let primaries: Arc<dyn PrimaryGetter> = match &elector {
            Some(elector) => elector.clone(),
            None => Arc::new(StaticElector::new(&storages, &default_primaries)),
        };

        let router = Router::new(
            storages,
            &default_primaries,
            health.clone(),
            primaries,
            datastore.repositories.clone(),
            rand.clone(),
        );
        let registry = Registry::with_overrides(&config.methods).context("build method registry")?;
        let mut transactions = TransactionManager::new();
        if let Some(timeout) = config.transactions.vote_timeout() {
            transactions = transactions.with_collect_timeout(timeout);
        }
        let failover_lock = Arc::new(RwLock::new(()));
        let coordinator = Coordinator::new(
            registry,
            router,
            Arc::new(transactions),
            datastore.repositories.clone(),
            datastore.queue.clone(),
            metrics.clone(),
            failover_lock.clone(),
            config.transaction_callback_address.clone(),
        );
        let auth = Authenticator::new(config.auth.token.clone(), config.auth.transitioning);
        let proxy = Arc::new(Proxy::new(coordinator, nodes.clone(), auth));

        Ok(Self {
            config,
            datastore,
            nodes,
            metrics,
            rand,
            health,
            health_manager,
            elector,
            failover_lock,
            proxy,
        })
    }

    pub fn proxy(&self) -> &Arc<Proxy> {
        &self.proxy
    }

    pub fn datastore(&self) -> &Datastore {
        &self.datastore
    }

    pub fn metrics(&self) -> &Arc<ProxyMetrics> {
        &self.metrics
    }

    pub fn health(&self) -> &Arc<dyn HealthChecker> {
        &self.health
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.config.storages(),
            self.datastore.repositories.clone(),
            self.datastore.queue.clone(),
            self.health.clone(),
            self.rand.clone(),
            self.metrics.clone(),
        )
    }

    fn replication_manager(&self) -> ReplicationManager {
        let replication = &self.config.replication;
        ReplicationManager::new(
            self.config.storages(),
            self.datastore.queue.clone(),
            self.datastore.repositories.clone(),
            self.health.clone(),
            Arc::new(GrpcReplicator::new(self.nodes.clone())),
            self.metrics.clone(),
            ReplicationManagerConfig {
                batch_size: replication.batch_size.max(1),
                workers: replication.parallel_storage_processing_workers.max(1),
                job_timeout: replication.job_timeout(),
                backoff_initial: replication.backoff_initial(),
                backoff_max: replication.backoff_max(),
            },
        )
    }

    /// Probe the backends once so the first calls are not rejected for lack
    /// of healthy storages.
    pub async fn check_health(&self) {
        if let Some(manager) = &self.health_manager {
            if let Err(err) = manager.check_once().await {
                tracing::warn!(error = ?err, "initial health check failed");
            }
        }
    }

    fn spawn_background(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(manager) = &self.health_manager {
            handles.push(manager.clone().spawn(shutdown.clone()));
            if let Some(elector) = &self.elector {
                handles.push(elector.clone().spawn(
                    manager.subscribe(),
                    self.config.failover.election_interval(),
                    self.failover_lock.clone(),
                    shutdown.clone(),
                ));
            }
        }
        handles.extend(Arc::new(self.replication_manager()).spawn(shutdown.clone()));
        if let Some(interval) = self.config.reconciliation.scheduling_interval() {
            handles.push(Arc::new(self.reconciler()).spawn(interval, shutdown.clone()));
        }
        if let Some(interval) = self.config.metrics_log_interval() {
            handles.push(spawn_metrics_logger(self.metrics.clone(), interval, shutdown.clone()));
        }
        handles
    }

    /// Serve on `listener` until `shutdown` resolves, then stop the
    /// background loops.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr().context("read listener address")?;
        self.check_health().await;

        let (stop_tx, stop_rx) = watch::channel(false);
        let handles = self.spawn_background(&stop_rx);
        tracing::info!(
            listen_addr = %local_addr,
            backends = self.nodes.len(),
            failover = self.health_manager.is_some(),
            "proxy serving"
        );

        let router = self.proxy.clone().into_router();
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .context("serve gRPC");

        let _ = stop_tx.send(true);
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "background task failed");
            }
        }
        tracing::info!("proxy stopped");
        served
    }
}

/// Bind the configured address and serve until ctrl-c.
pub async fn run(config: Config, datastore: Datastore) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("bind {}", config.listen_addr))?;
    let app = App::build(config, datastore)?;
    app.serve(listener, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        tracing::info!("shutdown requested");
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(extra: &str) -> Config {
        Config::from_toml_str(&format!(
            r#"
listen_addr = "127.0.0.1:0"
metrics_log_interval_ms = 0

[[virtual_storage]]
name = "vs"

[[virtual_storage.node]]
storage = "n1"
address = "tcp://127.0.0.1:1"
default_primary = true

[[virtual_storage.node]]
storage = "n2"
address = "tcp://127.0.0.1:2"

{extra}
"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn static_mode_reports_every_storage_healthy() {
        let config = config("[failover]\nenabled = false\n");
        let datastore = open_datastore(&config).await.unwrap();
        let app = App::build(config, datastore).unwrap();
        assert_eq!(app.health().healthy().count("vs"), 2);
        assert!(app.health_manager.is_none());
        assert!(app.elector.is_none());
    }

    #[tokio::test]
    async fn serve_stops_on_shutdown() {
        let config = config("[reconciliation]\nscheduling_interval_ms = 0\n");
        let datastore = open_datastore(&config).await.unwrap();
        let app = App::build(config, datastore).unwrap();
        assert!(app.health_manager.is_some());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(app.serve(listener, async {
            let _ = rx.await;
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(10), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
