//! Connection pool construction and tuning.
//!
//! All strata services share one [`sqlx::PgPool`] per process. The pool is
//! sized for a mixed workload: short transactional writes from the API
//! handlers plus longer-running reads from the job processor.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use tracing::{info, warn};

use strata_core::{defaults, Result};

/// Pool tuning knobs with sensible defaults for a single-node deployment.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// Minimum number of idle connections to keep warm.
    pub min_connections: u32,
    /// How long to wait for a connection before giving up.
    pub acquire_timeout: Duration,
    /// How long a connection may sit idle before being closed.
    pub idle_timeout: Duration,
    /// Maximum lifetime of a single connection.
    pub max_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: defaults::DB_MAX_CONNECTIONS,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(defaults::DB_ACQUIRE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl PoolConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `STRATA_DB_MAX_CONNECTIONS` | `10` | Pool connection cap |
    /// | `STRATA_DB_ACQUIRE_TIMEOUT_SECS` | `10` | Wait before acquire fails |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_connections = std::env::var("STRATA_DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults.max_connections);
        let acquire_timeout = std::env::var("STRATA_DB_ACQUIRE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.acquire_timeout);
        Self {
            max_connections,
            acquire_timeout,
            ..defaults
        }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

/// Create a connection pool with default settings.
pub async fn create_pool(database_url: &str) -> Result<Pool<Postgres>> {
    create_pool_with_config(database_url, PoolConfig::default()).await
}

/// Create a connection pool with explicit tuning.
pub async fn create_pool_with_config(
    database_url: &str,
    config: PoolConfig,
) -> Result<Pool<Postgres>> {
    let started = std::time::Instant::now();

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(config.max_lifetime)
        .connect(database_url)
        .await?;

    info!(
        subsystem = "db",
        component = "pool",
        op = "connect",
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        duration_ms = started.elapsed().as_millis() as u64,
        "database pool ready"
    );

    Ok(pool)
}

/// Emit a snapshot of pool utilization. The server calls this on an
/// interval task.
pub fn log_pool_metrics(pool: &Pool<Postgres>) {
    let size = pool.size();
    let idle = pool.num_idle();

    if size > 0 && idle == 0 {
        warn!(
            subsystem = "db",
            component = "pool",
            op = "metrics",
            size,
            idle,
            "pool has no idle connections"
        );
    } else {
        info!(
            subsystem = "db",
            component = "pool",
            op = "metrics",
            size,
            idle,
            "pool utilization"
        );
    }
}
