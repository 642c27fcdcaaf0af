use std::{sync::Arc, time::Duration};

use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{info, warn};

use crate::{
    accrual::{AccrualClient, AccrualClientConfig},
    api::handler::AppState,
    auth::{AuthConfig, AuthService},
    config::Config,
    error::{AppError, AppResult},
    gateway::OrderGateway,
    ledger::{models::PendingOrder, InMemoryLedger, LedgerRepository, LedgerStore},
    settlement::{OrderQueue, ReconciliationWorker, WorkerConfig},
};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(3);

/// Wire the ledger, accrual client, queue, worker and HTTP state together.
///
/// The worker is returned unstarted, already seeded with every order that was
/// still pending when the process last stopped.
pub async fn initialize_app_state(config: &Config) -> AppResult<(AppState, ReconciliationWorker)> {
    info!("Initializing application components ...");

    let ledger: Arc<dyn LedgerStore> = match &config.database_uri {
        Some(uri) => {
            let pool = initialize_database(uri, config.db_max_connections).await?;
            Arc::new(LedgerRepository::new(pool))
        }
        None => {
            warn!("⚠️  DATABASE_URI not set - using the in-memory ledger, data is lost on restart");
            Arc::new(InMemoryLedger::new())
        }
    };

    if config.uses_dev_secret() {
        warn!("⚠️  SECRET_KEY not set - using the development secret");
    }

    let accrual = AccrualClient::new(AccrualClientConfig {
        base_url: config.accrual_system_address.clone(),
        timeout: config.accrual_timeout(),
        max_attempts: config.accrual_max_attempts,
        ..AccrualClientConfig::default()
    })
    .map_err(|e| AppError::Config(e.to_string()))?;
    info!("✅ Accrual client configured for {}", config.accrual_system_address);

    let (queue, drain) = OrderQueue::bounded(config.order_queue_capacity);

    let mut worker = ReconciliationWorker::new(
        WorkerConfig {
            tick: config.worker_tick(),
            settle_timeout: SETTLE_TIMEOUT,
        },
        ledger.clone(),
        Arc::new(accrual),
        drain,
    );
    let pending = ledger.pending_orders().await?;
    worker.seed(pending.iter().map(PendingOrder::from));

    let auth = AuthService::new(
        ledger.clone(),
        AuthConfig {
            secret: config.secret_key.clone(),
            session_ttl: config.session_ttl(),
        },
    );

    let state = AppState {
        gateway: Arc::new(OrderGateway::new(ledger.clone(), queue)),
        auth: Arc::new(auth),
        ledger,
    };

    info!("✓ Application state initialized");
    Ok((state, worker))
}

async fn initialize_database(database_url: &str, max_connections: u32) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: {} max connections", max_connections);

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
