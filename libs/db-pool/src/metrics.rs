//! Prometheus metrics for database connection pool
//!
//! Tracks pool size, connection acquisition latency, and errors

use prometheus::{register_histogram_vec, register_int_gauge_vec, HistogramVec, IntGaugeVec};
use sqlx::{pool::PoolConnection, PgPool, Postgres};
use std::time::Instant;

lazy_static::lazy_static! {
    /// Database connection pool size by state (idle/active/max)
    static ref DB_POOL_CONNECTIONS: IntGaugeVec = register_int_gauge_vec!(
        "db_pool_connections",
        "Database pool connection count by state",
        &["service", "state"]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Time to acquire a connection from the pool
    static ref DB_POOL_ACQUIRE_DURATION: HistogramVec = register_histogram_vec!(
        "db_pool_acquire_duration_seconds",
        "Time to acquire connection from pool",
        &["service"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Connection acquisition errors by type
    static ref DB_POOL_CONNECTION_ERRORS: IntGaugeVec = register_int_gauge_vec!(
        "db_pool_connection_errors_total",
        "Connection acquisition errors",
        &["service", "error_type"]
    ).expect("Prometheus metrics registration should succeed at startup");
}

/// Update connection pool metrics (called periodically)
pub(crate) fn update_pool_metrics(pool: &PgPool, service: &str) {
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

/// Acquire a connection from the pool and record metrics
///
/// This is a drop-in replacement for `pool.acquire().await` that automatically
/// tracks acquisition latency and error rates.
///
/// # Example
/// ```no_run
/// # use db_pool::{create_pool, DbConfig, acquire_with_metrics};
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// # let pool = create_pool(DbConfig::for_service("test")).await?;
/// let conn = acquire_with_metrics(&pool, "my-service").await?;
/// sqlx::query("SELECT 1").execute(&mut *conn).await?;
/// # Ok(())
/// # }
/// ```
pub async fn acquire_with_metrics(
    pool: &PgPool,
    service: &str,
) -> Result<PoolConnection<Postgres>, sqlx::Error> {
    let start = Instant::now();
    let result = pool.acquire().await;

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

    result
}

/// Configuration for `acquire_with_backpressure`'s early-rejection threshold.
///
/// Utilization is `active_connections / max_connections`; once it reaches
/// `threshold`, new acquisitions are rejected immediately instead of queuing
/// behind the pool's own (much longer) `acquire_timeout`.
#[derive(Debug, Clone, Copy)]
pub struct BackpressureConfig {
    pub threshold: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self { threshold: 0.85 }
    }
}

impl BackpressureConfig {
    /// Reads `DB_POOL_BACKPRESSURE_THRESHOLD`, falling back to the default
    /// (and logging a warning) on a missing, unparsable, or out-of-range value.
    pub fn from_env() -> Self {
        match std::env::var("DB_POOL_BACKPRESSURE_THRESHOLD") {
            Ok(raw) => match raw.parse::<f64>() {
                Ok(threshold) if threshold > 0.0 && threshold <= 1.0 => Self { threshold },
                Ok(threshold) => {
                    tracing::warn!(
                        value = threshold,
                        "DB_POOL_BACKPRESSURE_THRESHOLD out of range (0.0, 1.0], using default"
                    );
                    Self::default()
                }
                Err(_) => {
                    tracing::warn!(
                        value = %raw,
                        "DB_POOL_BACKPRESSURE_THRESHOLD is not a number, using default"
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

/// Pool utilization reached or exceeded the configured backpressure threshold.
#[derive(Debug)]
pub struct PoolExhaustedError {
    pub service: String,
    pub utilization: f64,
    pub threshold: f64,
}

impl std::fmt::Display for PoolExhaustedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pool '{}' at {:.2}% utilization, refusing acquisition above {:.2}% threshold",
            self.service,
            self.utilization * 100.0,
            self.threshold * 100.0
        )
    }
}

impl std::error::Error for PoolExhaustedError {}

/// Acquire a connection, rejecting immediately once pool utilization reaches
/// `config.threshold` rather than queuing behind the pool's own acquire timeout.
///
/// This is a fast-fail alternative to [`acquire_with_metrics`] for call sites
/// that would rather shed load than wait: under sustained overload, queuing
/// every caller behind `acquire_timeout` turns one slow dependency into many
/// slow callers.
pub async fn acquire_with_backpressure(
    pool: &PgPool,
    service: &str,
    config: &BackpressureConfig,
) -> Result<PoolConnection<Postgres>, BackpressureError> {
    let max = pool.options().get_max_connections().max(1) as f64;
    let active = (pool.size() as i64 - pool.num_idle() as i64).max(0) as f64;
    let utilization = active / max;

    if utilization >= config.threshold {
        DB_POOL_CONNECTION_ERRORS
            .with_label_values(&[service, "backpressure"])
            .inc();
        return Err(BackpressureError::Exhausted(PoolExhaustedError {
            service: service.to_string(),
            utilization,
            threshold: config.threshold,
        }));
    }

    Ok(acquire_with_metrics(pool, service).await?)
}

#[derive(Debug, thiserror::Error)]
pub enum BackpressureError {
    #[error(transparent)]
    Exhausted(#[from] PoolExhaustedError),
    #[error(transparent)]
    Pool(#[from] sqlx::Error),
}
