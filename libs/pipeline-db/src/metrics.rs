//! Prometheus metrics and backpressure for the SQLite connection pool.

use sqlx::{pool::PoolConnection, Sqlite, SqlitePool};
use std::time::Instant;
use thiserror::Error;

#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{register_histogram_vec, register_int_gauge_vec, HistogramVec, IntGaugeVec};

#[cfg(feature = "metrics")]
static DB_POOL_CONNECTIONS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "pipeline_db_pool_connections",
        "Database pool connection count by state",
        &["service", "state"]
    )
    .expect("failed to register pipeline_db_pool_connections")
});

#[cfg(feature = "metrics")]
static DB_POOL_ACQUIRE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "pipeline_db_pool_acquire_duration_seconds",
        "Time to acquire connection from pool",
        &["service"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    )
    .expect("failed to register pipeline_db_pool_acquire_duration_seconds")
});

#[cfg(feature = "metrics")]
static DB_POOL_CONNECTION_ERRORS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "pipeline_db_pool_connection_errors_total",
        "Connection acquisition errors",
        &["service", "error_type"]
    )
    .expect("failed to register pipeline_db_pool_connection_errors_total")
});

/// Update connection pool gauges. Called periodically from a background task.
pub(crate) fn update_pool_metrics(pool: &SqlitePool, service: &str) {
    #[cfg(feature = "metrics")]
    {
        let size = pool.size() as i64;
        let idle = pool.num_idle() as i64;
        let active = size - idle;

        DB_POOL_CONNECTIONS
            .with_label_values(&[service, "idle"])
            .set(idle);
        DB_POOL_CONNECTIONS
            .with_label_values(&[service, "active"])
            .set(active);
        DB_POOL_CONNECTIONS
            .with_label_values(&[service, "max"])
            .set(pool.options().get_max_connections() as i64);
    }
    #[cfg(not(feature = "metrics"))]
    {
        let _ = (pool, service);
    }
}

/// Acquire a connection from the pool and record latency/error metrics.
///
/// Drop-in replacement for `pool.acquire().await`.
pub async fn acquire_with_metrics(
    pool: &SqlitePool,
    service: &str,
) -> Result<PoolConnection<Sqlite>, sqlx::Error> {
    let start = Instant::now();
    let result = pool.acquire().await;

    #[cfg(feature = "metrics")]
    {
        DB_POOL_ACQUIRE_DURATION
            .with_label_values(&[service])
            .observe(start.elapsed().as_secs_f64());

        if let Err(e) = &result {
            let error_type = match e {
                sqlx::Error::PoolTimedOut => "timeout",
                sqlx::Error::PoolClosed => "closed",
                _ => "other",
            };
            DB_POOL_CONNECTION_ERRORS
                .with_label_values(&[service, error_type])
                .inc();
        }
    }
    #[cfg(not(feature = "metrics"))]
    {
        let _ = start;
    }

    result
}

/// Backpressure thresholds for pool utilization.
///
/// When the fraction of in-use connections exceeds `threshold`,
/// [`acquire_with_backpressure`] rejects new acquisitions instead of queuing
/// callers behind an already-saturated pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackpressureConfig {
    pub threshold: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self { threshold: 0.85 }
    }
}

impl BackpressureConfig {
    /// Read `DB_POOL_BACKPRESSURE_THRESHOLD` from the environment, falling
    /// back to the default for anything missing or outside `(0.0, 1.0]`.
    pub fn from_env() -> Self {
        let default = Self::default();
        match std::env::var("DB_POOL_BACKPRESSURE_THRESHOLD")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
        {
            Some(threshold) if threshold > 0.0 && threshold <= 1.0 => Self { threshold },
            _ => default,
        }
    }
}

/// Returned by [`acquire_with_backpressure`] when pool utilization is above
/// the configured threshold.
#[derive(Debug, Error)]
#[error("pool exhausted for service '{service}': utilization {:.2}% exceeds threshold {:.2}%", utilization * 100.0, threshold * 100.0)]
pub struct PoolExhaustedError {
    pub service: String,
    pub utilization: f64,
    pub threshold: f64,
}

/// Acquire a connection, rejecting the request up front if the pool is
/// already saturated past `config.threshold` rather than queuing behind it.
pub async fn acquire_with_backpressure(
    pool: &SqlitePool,
    service: &str,
    config: &BackpressureConfig,
) -> Result<PoolConnection<Sqlite>, PoolExhaustedError> {
    let max = pool.options().get_max_connections() as f64;
    let in_use = (pool.size() as i64 - pool.num_idle() as i64).max(0) as f64;
    let utilization = if max > 0.0 { in_use / max } else { 0.0 };

    if utilization > config.threshold {
        return Err(PoolExhaustedError {
            service: service.to_string(),
            utilization,
            threshold: config.threshold,
        });
    }

    acquire_with_metrics(pool, service)
        .await
        .map_err(|_| PoolExhaustedError {
            service: service.to_string(),
            utilization,
            threshold: config.threshold,
        })
}
