//! Faultline binary entry point.
//!
//! Serves the error-tracking API and runs the retention task until Ctrl+C
//! or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use faultline_telemetry::{FaultlineConfig, Service};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "faultline", version, about = "Error grouping and tracking service")]
struct Cli {
    /// Configuration file (default: ./faultline.toml).
    #[arg(short, long, env = "FAULTLINE_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "faultline_telemetry=debug,faultline_gateway=debug,faultline_state=debug,tower_http=debug"
    } else {
        "faultline_telemetry=info,faultline_gateway=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting faultline");

    let config = match cli.config.as_deref() {
        Some(path) => FaultlineConfig::load_from(path),
        None => FaultlineConfig::load(),
    }
    .context("failed to load configuration")?;
    let config = Arc::new(config);
    tracing::info!(
        listen_addr = %config.server.listen_addr,
        environment = config.server.environment.as_deref().unwrap_or("-"),
        "Configuration loaded"
    );

    let mut service = Service::build(Arc::clone(&config))
        .await
        .context("failed to initialise service")?;
    service.start_background();

    let listener = tokio::net::TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
    tracing::info!(addr = %config.server.listen_addr, "HTTP API listening");

    let result = axum::serve(listener, service.router())
        .with_graceful_shutdown(shutdown_signal("HTTP API"))
        .await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "HTTP server error");
    }

    service.shutdown().await;
    tracing::info!("Shutdown complete");
    result.context("HTTP server failed")
}

/// Create a shutdown signal future for graceful shutdown.
async fn shutdown_signal(server_name: &'static str) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!(server = server_name, "Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!(server = server_name, "Received SIGTERM, initiating shutdown");
        }
    }
}
