use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::prelude::*;

mod cli;
mod config;

use crate::config::{CliOverrides, FileConfig};

#[derive(Parser)]
#[command(name = "hdesk")]
#[command(about = "Helpdesk API client with a resilient real-time follower")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config directory holding config.toml and the default cursor
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Helpdesk base URL (overrides config.toml and HDESK_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Account id (overrides config.toml and HDESK_ACCOUNT_ID)
    #[arg(long, global = true)]
    account_id: Option<u64>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream real-time events as JSON lines until interrupted
    Follow(cli::follow::FollowArgs),

    /// Issue one REST call through the retrying executor
    Api(cli::api::ApiArgs),

    /// Inspect or reset the follow cursor
    Cursor(cli::cursor::CursorArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config_dir = config::config_dir(cli.config_dir.clone())?;
    let overrides = CliOverrides {
        base_url: cli.base_url.clone(),
        account_id: cli.account_id,
    };
    let file_config: FileConfig = config::load_config(&config_dir, &overrides)
        .extract()
        .with_context(|| format!("Invalid configuration in {}", config_dir.display()))?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    match cli.command {
        Commands::Follow(args) => cli::follow::follow_command(&file_config, &config_dir, args, cancel).await,
        Commands::Api(args) => cli::api::api_command(&file_config, args, cancel).await,
        Commands::Cursor(args) => cli::cursor::cursor_command(&file_config, &config_dir, args),
    }
}

/// Logs go to stderr; stdout carries only data.
fn init_tracing(debug: bool) {
    let default_directive = if debug {
        "hdesk=debug,helpdesk=debug,helpdesk_api=debug,helpdesk_stream=debug,warn"
    } else {
        "hdesk=info,helpdesk=info,helpdesk_api=info,helpdesk_stream=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

/// Cancel on Ctrl+C or SIGTERM. Everything downstream shuts down in order.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Received shutdown signal, cleaning up...");
    cancel.cancel();
}
