//! qterm Server - terminal bridge binary.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use qterm_server::{ServerConfig, run_with_shutdown};

/// qterm terminal bridge server
#[derive(Parser)]
#[command(name = "qterm-server")]
#[command(about = "Bridges a WebSocket terminal front end to a local or SSH shell")]
#[command(version)]
struct Args {
    /// Configuration file path (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides PORT and QTERM_LISTEN_ADDR
    #[arg(short, long)]
    listen: Option<String>,

    /// Shell started for local sessions
    #[arg(long)]
    shell: Option<String>,

    /// Remote target file re-read on every remote connect
    #[arg(long)]
    remote_config: Option<PathBuf>,

    /// Reject SSH hosts that are not already in the known-hosts file
    #[arg(long)]
    strict_host_keys: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,
}

fn setup_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        subscriber
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }
}

fn load_config(args: &Args) -> anyhow::Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::from_env()?,
    };

    if let Some(listen) = &args.listen {
        config.listen_addr = listen.clone();
    }
    if let Some(shell) = &args.shell {
        config.shell = shell.clone();
    }
    if let Some(path) = &args.remote_config {
        config.remote_config = Some(path.clone());
    }
    if args.strict_host_keys {
        config.trust.strict = true;
    }

    Ok(config)
}

async fn shutdown_signal(shutdown_timeout: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
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
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown (timeout: {}s)...", shutdown_timeout);
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown (timeout: {}s)...", shutdown_timeout);
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    setup_logging(&args.log_level, args.json_logs);

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("Starting qterm server on {}", config.listen_addr);
    info!("Local shell: {}", config.shell);
    if config.trust.strict {
        info!("Strict host key checking enabled");
    } else {
        info!("Unknown SSH hosts are trusted on first use");
    }
    info!("Press Ctrl+C to stop");

    let shutdown = shutdown_signal(config.shutdown_timeout);

    if let Err(e) = run_with_shutdown(config, shutdown).await {
        error!("Server error: {:#}", e);
        return ExitCode::FAILURE;
    }

    info!("Server stopped");
    ExitCode::SUCCESS
}
