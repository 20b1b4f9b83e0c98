#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

//! Archestrad - Archestra gateway daemon
//!
//! This daemon provides:
//! - Provider-compatible LLM proxy endpoints with streaming
//! - Trust, tool-invocation, and quota policy enforcement
//! - SQLite interaction audit trail
//! - SSE event streaming for observation tooling

use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use archestrad::api;
use archestrad::config::Config;
use archestrad::state::AppState;

#[derive(Parser)]
#[command(name = "archestrad")]
#[command(about = "Archestra gateway daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (default)
    Start {
        /// Bind address (HOST:PORT)
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Show daemon status
    Status {
        /// Daemon URL
        #[arg(default_value = "http://127.0.0.1:9800")]
        url: String,
    },

    /// Show effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(ref path) = cli.config {
        Config::from_file(path)?
    } else {
        Config::load_default()?
    };

    let log_level = match cli.verbose {
        0 => config.tracing_level(),
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::filter::LevelFilter::from_level(
            log_level,
        ))
        .init();

    match cli.command {
        None | Some(Commands::Start { .. }) => {
            if let Some(Commands::Start {
                listen: Some(listen),
            }) = cli.command
            {
                config.listen = listen;
            }

            config.validate()?;
            run_daemon(config).await
        }

        Some(Commands::Status { url }) => check_status(&url).await,

        Some(Commands::ShowConfig) => {
            let yaml = serde_yaml::to_string(&config)?;
            println!("{}", yaml);
            Ok(())
        }
    }
}

async fn run_daemon(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        listen = %config.listen,
        database = %config.database_path.display(),
        anthropic = %config.providers.anthropic_base_url,
        openai = %config.providers.openai_base_url,
        secondary_model = %config.secondary_model,
        "Starting archestrad"
    );

    let (state, quota_handle) = AppState::new(config.clone()).await?;

    let app = api::create_router(state.clone());

    let addr: SocketAddr = config.listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, "Listening");

    let shutdown_signal = async {
        let ctrl_c = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(err) => {
                    tracing::error!(error = %err, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        tracing::info!("Shutdown signal received");
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await?;

    // Drain queued usage updates before exit; completed interactions keep
    // their accounting.
    let interaction_count = state
        .repo
        .interactions
        .count_interactions()
        .unwrap_or_default();
    drop(state);
    quota_handle.drained().await;

    tracing::info!(interactions = interaction_count, "Daemon stopped");
    Ok(())
}

async fn check_status(url: &str) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let resp = client.get(format!("{}/health", url)).send().await?;

    if resp.status().is_success() {
        let health: api::HealthResponse = resp.json().await?;
        println!("Status: {}", health.status);
        println!("Version: {}", health.version);
        println!("Uptime: {}s", health.uptime_secs);
        println!("Interactions: {}", health.interaction_count);
        println!("Dropped quota updates: {}", health.quota_updates_dropped);
    } else {
        println!("Error: {} {}", resp.status(), resp.text().await?);
    }

    Ok(())
}
