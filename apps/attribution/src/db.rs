use std::cell::Cell;
use std::time::Duration;

use anyhow::{Context, Result};
use deadpool_postgres::{Manager, ManagerConfig, Pool, PoolError, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;

/// A checked-out client. Dropping it hands the connection back to the pool.
pub type PooledClient = deadpool_postgres::Object;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub max_idle_connections: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            max_idle_connections: 4,
            acquire_timeout: Duration::from_millis(2_000),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("no pooled connection available within {0:?}")]
    AcquireTimeout(Duration),
    #[error("connection pool is closed")]
    PoolClosed,
    #[error("connect to postgres: {0}")]
    Connect(#[from] tokio_postgres::Error),
    #[error("connection pool error: {0}")]
    Pool(String),
}

/// Process-wide postgres handle. At most `max_connections` clients are
/// checked out at once; idle clients beyond `max_idle_connections` or older
/// than `idle_timeout` are closed by a background sweep.
#[derive(Clone)]
pub struct AttributionDb {
    pool: Pool,
    acquire_timeout: Duration,
}

impl AttributionDb {
    pub async fn connect(database_url: &str, config: PoolConfig) -> Result<Self> {
        let pg_config = database_url
            .parse::<tokio_postgres::Config>()
            .context("parse postgres connection string")?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Verified,
            },
        );
        let max_connections = config.max_connections.max(1);
        let pool = Pool::builder(manager)
            .max_size(max_connections)
            .wait_timeout(Some(config.acquire_timeout))
            .create_timeout(Some(config.acquire_timeout))
            .recycle_timeout(Some(config.acquire_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .context("build postgres connection pool")?;

        let db = Self {
            pool,
            acquire_timeout: config.acquire_timeout,
        };

        // Fail startup early when the database is unreachable.
        drop(db.acquire().await.context("connect to postgres")?);

        spawn_idle_sweep(
            db.pool.clone(),
            config.max_idle_connections.min(max_connections),
            config.idle_timeout,
        );
        Ok(db)
    }

    pub async fn acquire(&self) -> Result<PooledClient, DbError> {
        self.pool.get().await.map_err(|error| match error {
            PoolError::Timeout(_) => DbError::AcquireTimeout(self.acquire_timeout),
            PoolError::Backend(error) => DbError::Connect(error),
            PoolError::Closed => DbError::PoolClosed,
            other => DbError::Pool(other.to_string()),
        })
    }
}

fn spawn_idle_sweep(pool: Pool, max_idle: usize, idle_timeout: Duration) {
    let period = idle_timeout.min(Duration::from_secs(30));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if pool.is_closed() {
                break;
            }
            let closed = trim_idle(&pool, max_idle, idle_timeout);
            if closed > 0 {
                tracing::debug!(closed, "closed idle attribution postgres connections");
            }
        }
    });
}

/// Closes idle connections unused for longer than `idle_timeout`, then keeps
/// at most `max_idle` of the remainder. Returns how many were closed.
fn trim_idle(pool: &Pool, max_idle: usize, idle_timeout: Duration) -> usize {
    let kept = Cell::new(0_usize);
    let result = pool.retain(|_, metrics| {
        if metrics.last_used() > idle_timeout || kept.get() >= max_idle {
            return false;
        }
        kept.set(kept.get() + 1);
        true
    });
    result.removed.len()
}
