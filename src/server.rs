use std::time::Duration;

use axum::{http::StatusCode, Router};
use tokio::sync::watch;
use tower_http::{compression::CompressionLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    api::{handler::AppState, router},
    config::Config,
    middleware::create_cors_layer,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub fn create_app(state: AppState, config: &Config) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = router(state)
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            REQUEST_TIMEOUT,
        ))
        .layer(create_cors_layer(&config.cors_allowed_origins))
        // Add request tracing
        .layer(TraceLayer::new_for_http());

    info!("✓ HTTP routes configured");
    app
}

/// Serve until `shutdown` flips to true, then drain in-flight requests.
pub async fn run_server(
    app: Router,
    bind_address: &str,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            // A dropped sender also means shut down.
            let _ = shutdown.wait_for(|stop| *stop).await;
            info!("🛑 HTTP server shutting down");
        })
        .await
}
