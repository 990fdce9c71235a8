//! SQLite connection pool management for the pipeline's relational store.
//!
//! Provides unified pool creation, WAL-mode tuning, and metrics for every
//! component (file discovery, analysis workers, reconciliation, the outbox
//! poller) that talks to the `SQLITE_DB_PATH` database.

mod env_utils;
mod metrics;

use metrics::update_pool_metrics;
pub use env_utils::{parse_env_optional, parse_env_required, parse_env_with_default, safe_parse};
pub use metrics::{
    acquire_with_backpressure, acquire_with_metrics, BackpressureConfig, PoolExhaustedError,
};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info};

/// SQLite connection pool configuration.
#[derive(Clone)]
pub struct DbConfig {
    /// Component name for metrics labeling (e.g. "file-analysis-worker").
    pub service_name: String,
    /// Path to the SQLite database file, or `:memory:` for an in-memory pool.
    pub db_path: String,
    /// Maximum number of connections.
    pub max_connections: u32,
    /// Minimum number of connections kept warm.
    pub min_connections: u32,
    /// Connection acquisition timeout (get connection from pool).
    pub acquire_timeout_secs: u64,
    /// Connection idle timeout.
    pub idle_timeout_secs: u64,
    /// Connection maximum lifetime.
    pub max_lifetime_secs: u64,
    /// `PRAGMA busy_timeout` applied to every connection, milliseconds.
    pub busy_timeout_ms: u64,
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("service_name", &self.service_name)
            .field("db_path", &self.db_path)
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .field("idle_timeout_secs", &self.idle_timeout_secs)
            .field("max_lifetime_secs", &self.max_lifetime_secs)
            .field("busy_timeout_ms", &self.busy_timeout_ms)
            .finish()
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            service_name: String::from("unknown"),
            db_path: String::from("pipeline.db"),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_secs: 10,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
            busy_timeout_ms: 5000,
        }
    }
}

impl DbConfig {
    /// Build a [`DbConfig`] from `SQLITE_DB_PATH` and `DB_*` environment
    /// variables, falling back to sensible defaults for anything unset.
    pub fn from_env(service_name: &str) -> Result<Self, String> {
        let db_path = std::env::var("SQLITE_DB_PATH")
            .map_err(|_| "SQLITE_DB_PATH environment variable not set".to_string())?;

        let defaults = Self::default();
        Ok(Self {
            service_name: service_name.to_string(),
            db_path,
            max_connections: parse_env_with_default("DB_MAX_CONNECTIONS", defaults.max_connections),
            min_connections: parse_env_with_default("DB_MIN_CONNECTIONS", defaults.min_connections),
            acquire_timeout_secs: parse_env_with_default(
                "DB_ACQUIRE_TIMEOUT_SECS",
                defaults.acquire_timeout_secs,
            ),
            idle_timeout_secs: parse_env_with_default(
                "DB_IDLE_TIMEOUT_SECS",
                defaults.idle_timeout_secs,
            ),
            max_lifetime_secs: parse_env_with_default(
                "DB_MAX_LIFETIME_SECS",
                defaults.max_lifetime_secs,
            ),
            busy_timeout_ms: parse_env_with_default("DB_BUSY_TIMEOUT_MS", defaults.busy_timeout_ms),
        })
    }

    /// Log pool configuration at startup.
    pub fn log_config(&self) {
        info!(
            service = %self.service_name,
            max_connections = self.max_connections,
            min_connections = self.min_connections,
            acquire_timeout_secs = self.acquire_timeout_secs,
            idle_timeout_secs = self.idle_timeout_secs,
            max_lifetime_secs = self.max_lifetime_secs,
            "database pool configuration"
        );
    }
}

/// Create a SQLite connection pool with WAL mode, a busy timeout, and
/// automatic metrics monitoring.
pub async fn create_pool(config: DbConfig) -> Result<SqlitePool, sqlx::Error> {
    debug!(
        service = %config.service_name,
        db_path = %config.db_path,
        max = config.max_connections,
        min = config.min_connections,
        "creating SQLite pool"
    );

    let connect_options = SqliteConnectOptions::from_str(&format!("sqlite://{}", config.db_path))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
        .test_before_acquire(true)
        .connect_with(connect_options)
        .await?;

    match sqlx::query("SELECT 1").execute(&pool).await {
        Ok(_) => {
            info!(service = %config.service_name, "database pool created and verified");

            update_pool_metrics(&pool, &config.service_name);

            let pool_clone = pool.clone();
            let service = config.service_name.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(30));
                loop {
                    interval.tick().await;
                    update_pool_metrics(&pool_clone, &service);
                }
            });

            Ok(pool)
        }
        Err(e) => {
            error!(service = %config.service_name, error = %e, "database pool verification failed");
            Err(e)
        }
    }
}

/// Run pending migrations against `pool`.
pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::migrate::MigrateError> {
    debug!("running database migrations");
    sqlx::migrate!("../../store/migrations").run(pool).await?;
    info!("database migrations completed successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn test_default_config() {
        std::env::remove_var("DB_MAX_CONNECTIONS");
        std::env::remove_var("DB_MIN_CONNECTIONS");
        std::env::remove_var("DB_ACQUIRE_TIMEOUT_SECS");

        let config = DbConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 1);
        assert_eq!(config.acquire_timeout_secs, 10);
    }

    #[test]
    #[serial_test::serial]
    fn test_config_from_env_without_override() {
        std::env::remove_var("DB_MAX_CONNECTIONS");
        std::env::remove_var("DB_MIN_CONNECTIONS");
        std::env::remove_var("DB_ACQUIRE_TIMEOUT_SECS");
        std::env::remove_var("DB_IDLE_TIMEOUT_SECS");
        std::env::remove_var("DB_MAX_LIFETIME_SECS");
        std::env::set_var("SQLITE_DB_PATH", "test.db");

        let config = DbConfig::from_env("test-service").unwrap();

        assert_eq!(config.service_name, "test-service");
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 1);

        std::env::remove_var("SQLITE_DB_PATH");
    }

    #[test]
    #[serial_test::serial]
    fn test_config_from_env_missing_path() {
        std::env::remove_var("SQLITE_DB_PATH");
        assert!(DbConfig::from_env("test-service").is_err());
    }

    #[test]
    #[serial_test::serial]
    fn test_config_from_env_override() {
        std::env::set_var("SQLITE_DB_PATH", "test.db");
        std::env::set_var("DB_MAX_CONNECTIONS", "25");

        let config = DbConfig::from_env("test-service").unwrap();
        assert_eq!(config.max_connections, 25);

        std::env::remove_var("SQLITE_DB_PATH");
        std::env::remove_var("DB_MAX_CONNECTIONS");
    }

    #[test]
    fn test_backpressure_config_default() {
        let config = BackpressureConfig::default();
        assert_eq!(config.threshold, 0.85);
    }

    #[test]
    #[serial_test::serial]
    fn test_backpressure_config_from_env() {
        std::env::remove_var("DB_POOL_BACKPRESSURE_THRESHOLD");
        let config = BackpressureConfig::from_env();
        assert_eq!(config.threshold, 0.85);

        std::env::set_var("DB_POOL_BACKPRESSURE_THRESHOLD", "0.90");
        let config = BackpressureConfig::from_env();
        assert_eq!(config.threshold, 0.90);

        std::env::set_var("DB_POOL_BACKPRESSURE_THRESHOLD", "1.5");
        let config = BackpressureConfig::from_env();
        assert_eq!(config.threshold, 0.85);

        std::env::set_var("DB_POOL_BACKPRESSURE_THRESHOLD", "invalid");
        let config = BackpressureConfig::from_env();
        assert_eq!(config.threshold, 0.85);

        std::env::remove_var("DB_POOL_BACKPRESSURE_THRESHOLD");
    }

    #[test]
    fn test_pool_exhausted_error_display() {
        let error = PoolExhaustedError {
            service: "test-service".to_string(),
            utilization: 0.92,
            threshold: 0.85,
        };

        let msg = error.to_string();
        assert!(msg.contains("test-service"));
        assert!(msg.contains("92.00%"));
        assert!(msg.contains("85.00%"));
    }
}
