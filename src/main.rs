mod accrual;
mod api;
mod auth;
mod bootstrap;
mod config;
mod error;
mod gateway;
mod ledger;
mod middleware;
mod server;
mod settlement;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

// Initialize logging and tracing
fn init_tracing(log_level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| format!("{log_level},tower_http=debug,sqlx=warn")),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    dotenv::dotenv().ok();
    let config = Config::from_env().context("invalid configuration")?;

    // Initialize tracing
    init_tracing(&config.log_level);

    info!("🚀 Starting loyalty bonus backend");

    let (state, worker) = bootstrap::initialize_app_state(&config)
        .await
        .context("failed to initialize application state")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = worker.start(shutdown_rx.clone());

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                // Dropping the sender would stop everything, so keep it alive.
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    });

    // Create HTTP server
    let app = server::create_app(state, &config);

    // Run the Server
    server::run_server(app, &config.run_address, shutdown_rx)
        .await
        .with_context(|| format!("server on {} failed", config.run_address))?;

    if let Err(e) = worker_handle.await {
        error!("Reconciliation worker panicked: {}", e);
    }

    info!("👋 Shutdown complete");
    Ok(())
}
