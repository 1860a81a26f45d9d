//! Buildwatch: build lifecycle engine and live build dashboard API.
//!
//! Projects register a repository and build command. Builds are triggered
//! by hand or by GitHub push webhooks, run through a sequential pipeline in
//! the background, and stream status and log events to WebSocket observers.

mod config;
mod context;
mod dashboard;
mod error;
mod events;
mod metrics;
mod models;
mod routes;
mod services;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;

use crate::context::AppContext;

#[derive(Parser)]
#[command(name = "buildwatch", about = "Build lifecycle engine and dashboard API")]
struct Cli {
    /// Server port
    #[arg(short, long, env = "CI_PORT", default_value = "5000")]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let cli = Cli::parse();

    tracing::info!("Starting Buildwatch...");

    let ci_config = config::CiConfig::from_env();
    tracing::info!(
        success_rate = ci_config.success_rate,
        step_delay_scale = ci_config.step_delay_scale,
        step_timeout_secs = ci_config.step_timeout_secs,
        "Pipeline configured"
    );
    let ctx = Arc::new(AppContext::in_memory(ci_config));
    let app = routes::ci_router(ctx.clone());

    // Initialize metrics
    metrics::init_metrics();

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    tracing::info!("Buildwatch listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(ctx.clone()))
        .await?;

    tracing::info!("Stopping build dispatcher...");
    ctx.shutdown().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal(ctx: Arc<AppContext>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
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
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }

    // Open observer sockets would otherwise hold the server open.
    ctx.close_observers();
}
