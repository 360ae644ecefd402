use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use fleet_proxy::config::Config;
use fleet_proxy::dataloss::{dataloss, DataLossReport};
use fleet_proxy::datastore::PostgresStore;
use fleet_proxy::server::{open_datastore, run, App};

#[derive(Parser)]
#[command(name = "fleet-proxy")]
#[command(about = "Routing and replication proxy for Git storage backends", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, env = "FLEET_CONFIG", default_value = "config.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the proxy.
    Serve,
    /// Create or update the database schema.
    SqlMigrate,
    /// Schedule updates for lagging replicas once and exit.
    Reconcile,
    /// List repositories that may have lost writes.
    Dataloss {
        /// Only report this virtual storage.
        #[arg(long)]
        virtual_storage: Option<String>,
        /// Also list repositories whose primary is current but some replica is not.
        #[arg(long, default_value_t = false)]
        partially_replicated: bool,
    },
}

/// Failure classes, mapped to the process exit code.
enum Failure {
    Config(anyhow::Error),
    Database(anyhow::Error),
    Runtime(anyhow::Error),
}

impl Failure {
    fn exit_code(&self) -> u8 {
        match self {
            Failure::Config(_) => 1,
            Failure::Database(_) => 2,
            Failure::Runtime(_) => 3,
        }
    }

    fn error(&self) -> &anyhow::Error {
        match self {
            Failure::Config(err) | Failure::Database(err) | Failure::Runtime(err) => err,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,h2=warn,hyper=warn,sqlx=warn".into()),
        )
        .init();

    let args = Args::parse();
    match execute(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            tracing::error!("fleet-proxy failed: {:#}", failure.error());
            ExitCode::from(failure.exit_code())
        }
    }
}

async fn execute(args: Args) -> Result<(), Failure> {
    let config = Config::load(&args.config).map_err(Failure::Config)?;
    match args.command {
        Command::Serve => {
            let datastore = open_datastore(&config)
                .await
                .context("open datastore")
                .map_err(Failure::Database)?;
            run(config, datastore).await.map_err(Failure::Runtime)
        }
        Command::SqlMigrate => {
            let Some(database) = &config.database else {
                return Err(Failure::Config(anyhow::anyhow!(
                    "sql-migrate needs a [database] section"
                )));
            };
            let store = PostgresStore::connect(
                &database.url,
                database.max_connections,
                config.storages(),
                config.replication.max_attempts,
            )
            .await
            .context("connect to database")
            .map_err(Failure::Database)?;
            store
                .migrate()
                .await
                .context("apply schema")
                .map_err(Failure::Database)?;
            tracing::info!("database schema is up to date");
            Ok(())
        }
        Command::Reconcile => {
            let datastore = open_datastore(&config)
                .await
                .context("open datastore")
                .map_err(Failure::Database)?;
            let app = App::build(config, datastore).map_err(Failure::Config)?;
            app.check_health().await;
            let jobs = app
                .reconciler()
                .reconcile_once()
                .await
                .context("reconcile")
                .map_err(Failure::Database)?;
            for job in &jobs {
                println!(
                    "{}/{}: {} -> {}",
                    job.virtual_storage, job.relative_path, job.source_node_storage, job.target_node_storage
                );
            }
            println!("scheduled {} replication job(s)", jobs.len());
            Ok(())
        }
        Command::Dataloss {
            virtual_storage,
            partially_replicated,
        } => {
            if let Some(name) = &virtual_storage {
                if config.virtual_storage(name).is_none() {
                    return Err(Failure::Config(anyhow::anyhow!(
                        "unknown virtual storage {name:?}"
                    )));
                }
            }
            let datastore = open_datastore(&config)
                .await
                .context("open datastore")
                .map_err(Failure::Database)?;
            let entries = dataloss(
                datastore.repositories.as_ref(),
                &config.storages(),
                virtual_storage.as_deref(),
                partially_replicated,
            )
            .await
            .context("read repository records")
            .map_err(Failure::Database)?;
            print!("{}", DataLossReport(&entries));
            Ok(())
        }
    }
}
