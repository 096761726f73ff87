use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dmflow_core::config::AppConfig;
use dmflow_core::types::AccountId;
use dmflow_engine::{DisabledAgent, FlowEngine};
use dmflow_gateway::GraphClient;
use dmflow_server::{AppState, FlowServer};
use dmflow_store::SqliteStore;
use dmflow_workers::{QueueWorker, SubscriptionEnforcer};

#[derive(Parser)]
#[command(name = "dmflow", version, about = "Comment-to-DM flow automation")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "dmflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the webhook server with background workers
    Serve {
        /// Skip the trigger-queue worker and subscription enforcer
        #[arg(long)]
        no_workers: bool,
    },
    /// Run one trigger-queue pass and exit
    Drain,
    /// Run one subscription-enforcement pass and exit
    Enforce,
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dmflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
        AppConfig::default()
    };

    if let Commands::Config = cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let store = Arc::new(SqliteStore::open(&config.storage_path())?);
    let agent = Arc::new(DisabledAgent);

    let engines = {
        let store = store.clone();
        let agent = agent.clone();
        let gateway_config = config.gateway.clone();
        move |account: AccountId| -> dmflow_core::error::Result<FlowEngine> {
            let (user_id, access_token) = store.account_credentials(account)?;
            let gateway = Arc::new(GraphClient::new(&gateway_config, user_id, access_token)?);
            Ok(FlowEngine::new(store.clone(), gateway, agent.clone()))
        }
    };
    let engines = Arc::new(engines);

    match cli.command {
        Commands::Serve { no_workers } => {
            let cancel = CancellationToken::new();
            let cancel_clone = cancel.clone();

            // Graceful shutdown on Ctrl-C
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down...");
                cancel_clone.cancel();
            });

            if !no_workers {
                let worker = QueueWorker::new(
                    store.clone(),
                    engines.clone(),
                    config.workers.clone(),
                    config.rate_limit.clone(),
                    cancel.clone(),
                );
                tokio::spawn(async move { worker.run().await });

                let enforcer = SubscriptionEnforcer::new(
                    store.clone(),
                    config.workers.clone(),
                    cancel.clone(),
                );
                tokio::spawn(async move { enforcer.run().await });
            }

            let state = Arc::new(AppState {
                config,
                store,
                agent,
            });
            FlowServer::new(state).run(cancel).await?;
        }
        Commands::Drain => {
            let worker = QueueWorker::new(
                store,
                engines,
                config.workers.clone(),
                config.rate_limit.clone(),
                CancellationToken::new(),
            );
            let summary = worker.run_once().await;
            info!(
                processed = summary.processed,
                failed = summary.failed,
                skipped = summary.skipped,
                abandoned = summary.abandoned,
                "Queue pass finished"
            );
        }
        Commands::Enforce => {
            let enforcer = SubscriptionEnforcer::new(
                store,
                config.workers.clone(),
                CancellationToken::new(),
            );
            let summary = enforcer.run_once();
            info!(
                demoted = summary.demoted,
                flows_deactivated = summary.flows_deactivated,
                failures = summary.failures,
                "Enforcement pass finished"
            );
        }
        Commands::Config => unreachable!(),
    }

    Ok(())
}
