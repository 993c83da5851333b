//! marketing-sync - Resilient ingestion of marketing data from a rate-limited API
//!
//! This is the main entry point for the marketing-sync command line tool.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};

use marketing_sync::client::ApiClient;
use marketing_sync::config::Config;
use marketing_sync::database::{Repository, SqliteRepository};
use marketing_sync::models::{EntityType, SyncOptions};
use marketing_sync::sync::{ReportingService, SyncOrchestrator, SyncScheduler};
use marketing_sync::telemetry::init_tracing;

/// marketing-sync - Resilient ingestion of marketing data from a rate-limited API
#[derive(Parser, Debug)]
#[command(name = "marketing-sync")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "MARKETING_SYNC_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sync now and print the result as JSON
    Sync {
        /// Entity type to sync (repeatable; defaults to the configured list)
        #[arg(short, long = "entity", value_parser = parse_entity)]
        entities: Vec<EntityType>,

        /// Ignore the last sync time and fetch everything
        #[arg(long)]
        force: bool,

        /// Fetch only records changed since the last successful sync
        #[arg(long, conflicts_with = "full")]
        incremental: bool,

        /// Disable incremental fetching for this run
        #[arg(long)]
        full: bool,
    },

    /// Print the sync status of every entity type as JSON
    Status,

    /// Run the periodic scheduler until Ctrl+C or SIGTERM
    Run,
}

fn parse_entity(s: &str) -> Result<EntityType, String> {
    s.parse::<EntityType>().map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    init_tracing(&config.logging)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting marketing-sync"
    );

    let repository = Arc::new(SqliteRepository::new(&config.database).await?);
    info!(path = %config.database.path, "Database initialized");

    let outcome = match args.command {
        Command::Status => {
            repository.init_sync_statuses(&EntityType::ALL).await?;
            let reporting = ReportingService::new(repository.clone(), None, &config.cache);
            print_json(&reporting.statuses().await?)
        }
        Command::Sync {
            entities,
            force,
            incremental,
            full,
        } => {
            let options = SyncOptions {
                force,
                incremental: incremental || (config.sync.incremental && !full),
            };
            sync_once(&config, repository.clone(), entities, options).await
        }
        Command::Run => run(&config, repository.clone()).await,
    };

    repository.pool().close();
    outcome
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    match &args.config {
        Some(path) => {
            // Use eprintln! since tracing is not yet initialized
            eprintln!("Loading configuration from file: {}", path);
            let mut config = Config::from_file(path)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            config
                .apply_env()
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            Ok(config)
        }
        None => {
            eprintln!("Loading configuration from environment variables");
            Config::from_env().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
        }
    }
}

fn build_orchestrator(
    config: &Config,
    repository: Arc<SqliteRepository>,
) -> anyhow::Result<SyncOrchestrator> {
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    let client = ApiClient::new(config.api.clone())?;
    let repository: Arc<dyn Repository> = repository;
    Ok(SyncOrchestrator::new(
        repository,
        Arc::new(client),
        config.sync.clone(),
    ))
}

async fn sync_once(
    config: &Config,
    repository: Arc<SqliteRepository>,
    entities: Vec<EntityType>,
    options: SyncOptions,
) -> anyhow::Result<()> {
    let orchestrator = build_orchestrator(config, repository)?;
    orchestrator.initialize().await?;

    let entities = if entities.is_empty() {
        config.sync.entities.clone()
    } else {
        entities
    };
    let result = orchestrator.sync_all(&entities, options).await;
    print_json(&result)?;

    if !result.success {
        anyhow::bail!("{} entity sync(s) failed", result.errors.len());
    }
    Ok(())
}

async fn run(config: &Config, repository: Arc<SqliteRepository>) -> anyhow::Result<()> {
    let orchestrator = build_orchestrator(config, repository.clone())?;
    orchestrator.initialize().await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let monitor = repository
        .pool()
        .spawn_health_monitor(shutdown_tx.subscribe());

    let scheduler = SyncScheduler::new(orchestrator, shutdown_tx.subscribe());
    let scheduler_handle = tokio::spawn(scheduler.run());

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    if let Err(e) = scheduler_handle.await {
        error!(error = %e, "Scheduler task failed");
    }
    if let Err(e) = monitor.await {
        error!(error = %e, "Pool monitor task failed");
    }

    info!("marketing-sync shutdown complete");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Create a future that resolves when a shutdown signal is received
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
