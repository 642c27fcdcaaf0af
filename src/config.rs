use std::time::Duration;

use config::{ConfigError, Environment};
use serde::Deserialize;

/// Signing secret used when `SECRET_KEY` is not set. Fine for local runs only.
pub const DEV_SECRET_KEY: &str = "dev-secret-change-me";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub run_address: String,
    /// Postgres connection string. Without it the service runs on the
    /// in-memory ledger.
    pub database_uri: Option<String>,
    pub accrual_system_address: String,
    pub log_level: String,
    pub secret_key: String,
    pub worker_tick_ms: u64,
    pub order_queue_capacity: usize,
    pub accrual_timeout_ms: u64,
    pub accrual_max_attempts: usize,
    pub session_ttl_hours: i64,
    pub db_max_connections: u32,
    pub cors_allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Environment::default())
    }

    fn load(env: Environment) -> Result<Self, ConfigError> {
        let env = env
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("cors_allowed_origins");

        let config: Config = config::Config::builder()
            .set_default("run_address", "0.0.0.0:8081")?
            .set_default("accrual_system_address", "http://localhost:8080")?
            .set_default("log_level", "info")?
            .set_default("secret_key", DEV_SECRET_KEY)?
            .set_default("worker_tick_ms", 3000)?
            .set_default("order_queue_capacity", 100)?
            .set_default("accrual_timeout_ms", 2000)?
            .set_default("accrual_max_attempts", 3)?
            .set_default("session_ttl_hours", 24)?
            .set_default("db_max_connections", 20)?
            .set_default("cors_allowed_origins", vec!["http://localhost:3000"])?
            .add_source(env)
            .build()?
            .try_deserialize()?;

        config.validated()
    }

    fn validated(mut self) -> Result<Self, ConfigError> {
        self.database_uri = self.database_uri.filter(|uri| !uri.trim().is_empty());

        if self.worker_tick_ms == 0 {
            return Err(ConfigError::Message("WORKER_TICK_MS must be positive".into()));
        }
        if self.order_queue_capacity == 0 {
            return Err(ConfigError::Message("ORDER_QUEUE_CAPACITY must be positive".into()));
        }
        if self.session_ttl_hours <= 0 {
            return Err(ConfigError::Message("SESSION_TTL_HOURS must be positive".into()));
        }
        if self.secret_key.is_empty() {
            return Err(ConfigError::Message("SECRET_KEY must not be empty".into()));
        }
        Ok(self)
    }

    pub fn uses_dev_secret(&self) -> bool {
        self.secret_key == DEV_SECRET_KEY
    }

    pub fn worker_tick(&self) -> Duration {
        Duration::from_millis(self.worker_tick_ms)
    }

    pub fn accrual_timeout(&self) -> Duration {
        Duration::from_millis(self.accrual_timeout_ms)
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.session_ttl_hours)
    }
}
