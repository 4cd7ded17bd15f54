//! rangekeeper — sandbox orchestrator daemon and admin commands

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use rangekeeper_core::config::OrchestratorConfig;
use rangekeeper_core::engine::{ContainerEngine, DockerEngine};
use rangekeeper_core::gateway::ExecutionGateway;
use rangekeeper_core::network::NetworkManager;
use rangekeeper_core::pool::PoolManager;
use rangekeeper_core::validator::{CommandValidator, ValidationContext};
use rangekeeper_gateway::AppState;

#[derive(Parser)]
#[command(name = "rangekeeper", version, about = "Container pool orchestrator for cyber-range sandboxes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator and HTTP API
    Serve {
        /// Path to the TOML config file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override the configured bind address
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },
    /// Parse and validate a config file, then exit
    CheckConfig {
        config: PathBuf,
    },
    /// Run a command through the validator without executing it
    Validate {
        /// The command line to check
        command: String,
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short, long, default_value = "cli")]
        user: String,
    },
}

fn load_config(path: &Option<PathBuf>) -> Result<OrchestratorConfig> {
    match path {
        Some(path) => OrchestratorConfig::load(path),
        None => Ok(OrchestratorConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config, bind } => serve(config, bind).await,
        Command::CheckConfig { config } => {
            let parsed = OrchestratorConfig::load(&config)?;
            println!(
                "OK: {} templates, {} profiles, {} network segments",
                parsed.containers.len(),
                parsed.profiles.len(),
                parsed.networks.len()
            );
            Ok(())
        }
        Command::Validate {
            command,
            config,
            user,
        } => {
            let parsed = load_config(&config)?;
            let validator = CommandValidator::new(&parsed.rules);
            let verdict = validator.validate(
                &command,
                &ValidationContext {
                    user_id: user,
                    session_id: None,
                },
            );
            println!("{}", serde_json::to_string_pretty(&verdict)?);
            if !verdict.allowed {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

async fn serve(config_path: Option<PathBuf>, bind: Option<SocketAddr>) -> Result<()> {
    let config = load_config(&config_path)?;
    let addr: SocketAddr = match bind {
        Some(addr) => addr,
        None => config
            .server
            .bind
            .parse()
            .with_context(|| format!("invalid bind address '{}'", config.server.bind))?,
    };
    let drain_grace = Duration::from_secs(config.pool.drain_grace_secs);

    info!(
        "rangekeeper v{} starting ({} templates, {} profiles)",
        env!("CARGO_PKG_VERSION"),
        config.containers.len(),
        config.profiles.len()
    );

    let engine: Arc<dyn ContainerEngine> = Arc::new(DockerEngine::new(&config.engine));
    engine
        .ping()
        .await
        .context("container engine is not reachable")?;

    let network = Arc::new(NetworkManager::new(engine.clone()));
    network
        .ensure_all(&config.networks)
        .await
        .context("failed to converge network segments")?;

    let pool = Arc::new(PoolManager::new(engine.clone(), network.clone(), &config));
    if let Err(e) = pool.start_hot().await {
        // A missing image should not keep the API down; hot capacity can be
        // recovered via prepare once the image is available.
        warn!("Hot pool startup incomplete: {}", e);
    }

    let cancel = CancellationToken::new();
    let background = pool.clone().spawn_background(cancel.clone());

    let gateway = Arc::new(ExecutionGateway::new(engine, pool.clone(), config));
    let state = Arc::new(AppState {
        gateway,
        network,
        config_path,
    });

    let server = tokio::spawn(rangekeeper_gateway::serve(state, addr, cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received, draining pool");
    cancel.cancel();

    pool.shutdown(drain_grace).await;
    background.abort();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("API server exited with error: {}", e),
        Err(e) if !e.is_cancelled() => error!("API server task failed: {}", e),
        Err(_) => {}
    }
    info!("rangekeeper stopped");
    Ok(())
}
