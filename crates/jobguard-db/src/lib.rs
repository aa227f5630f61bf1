//! jobguard-db
//!
//! The durability pipeline's persistence layer: a pooled Postgres client
//! with health monitoring (`ConnectionManager`, spec.md §4.2) and the
//! authoritative set of SQL operations over `jobguard_jobs`
//! (`Repository`, spec.md §4.3). Every `Repository` method runs through a
//! `jobguard_circuit::CircuitBreaker` so a flaky DB fails fast rather than
//! stalling every caller.
//!
//! Modeled on `mqk-db`'s free-function-over-`PgPool` style: raw
//! `sqlx::query`/`query_as` plus manual `Row::try_get` mapping, `anyhow`
//! context strings for internal plumbing, and embedded `sqlx::migrate!`
//! migrations — generalized here into methods on `Repository` because
//! every one of them needs the shared circuit breaker.

pub mod repository;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub use repository::{JobRecord, JobStatus, QueueType, Repository, StatusCounts};

pub const ENV_DB_URL: &str = "JOBGUARD_DATABASE_URL";

/// `postgres` config key (spec.md §6): either a bare URL is supplied and
/// defaults fill in the rest, or every field is given explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionManagerConfig {
    pub url: String,
    pub pool_max: u32,
    #[serde(with = "duration_millis")]
    pub idle_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub statement_timeout: Duration,
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

impl ConnectionManagerConfig {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            pool_max: 10,
            idle_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(2),
            statement_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub total: u32,
    pub idle: u32,
    pub in_use: u32,
}

/// Three consecutive 5s samples of `idle == 0 && total >= max` before the
/// pool is declared critically exhausted (spec.md §4.2).
const EXHAUSTION_SAMPLE_THRESHOLD: u32 = 3;
const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Pooled DB client plus its background health monitor. `jobguard-coordinator`
/// owns exactly one of these per queue's repository.
pub struct ConnectionManager {
    pool: PgPool,
    pool_max: u32,
    exhausted: Arc<AtomicBool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    logger: jobguard_logging::Logger,
}

impl ConnectionManager {
    pub async fn connect(
        config: ConnectionManagerConfig,
        logger: jobguard_logging::Logger,
    ) -> Result<Self, jobguard_error::JobGuardError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_max)
            .idle_timeout(config.idle_timeout)
            .acquire_timeout(config.connect_timeout)
            .connect(&config.url)
            .await
            .map_err(jobguard_error::JobGuardError::postgres)?;

        let exhausted = Arc::new(AtomicBool::new(false));
        let monitor = spawn_monitor(pool.clone(), config.pool_max, exhausted.clone(), logger.clone());

        Ok(Self {
            pool,
            pool_max: config.pool_max,
            exhausted,
            monitor: Mutex::new(Some(monitor)),
            logger,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), jobguard_error::JobGuardError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| jobguard_error::JobGuardError::pool_exhausted(e.to_string()))
    }

    pub fn stats(&self) -> PoolStats {
        let total = self.pool.size();
        let idle = self.pool.num_idle() as u32;
        PoolStats {
            total,
            idle,
            in_use: total.saturating_sub(idle),
        }
    }

    /// Explicit startup probe (spec.md §4.2's `testConnection()`).
    pub async fn test_connection(&self) -> Result<(), jobguard_error::JobGuardError> {
        sqlx::query("select 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(jobguard_error::JobGuardError::postgres)
    }

    /// Fails with `PostgresConnection` while the monitor considers the pool
    /// critically exhausted; otherwise succeeds without touching the network.
    pub fn check_pool_health(&self) -> Result<(), jobguard_error::JobGuardError> {
        if self.exhausted.load(Ordering::SeqCst) {
            Err(jobguard_error::JobGuardError::pool_exhausted(
                "connection pool critically exhausted: idle == 0 for three consecutive samples",
            ))
        } else {
            Ok(())
        }
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.monitor.lock().await.take() {
            handle.abort();
        }
        self.pool.close().await;
    }
}

fn spawn_monitor(
    pool: PgPool,
    pool_max: u32,
    exhausted: Arc<AtomicBool>,
    logger: jobguard_logging::Logger,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
        let mut consecutive = 0u32;
        loop {
            ticker.tick().await;
            let total = pool.size();
            let idle = pool.num_idle() as u32;
            if idle == 0 && total >= pool_max {
                consecutive += 1;
            } else {
                consecutive = 0;
            }

            if consecutive >= EXHAUSTION_SAMPLE_THRESHOLD {
                if !exhausted.swap(true, Ordering::SeqCst) {
                    logger.warn("connection pool critically exhausted");
                }
            } else if exhausted.swap(false, Ordering::SeqCst) {
                logger.info("connection pool recovered");
            }
        }
    })
}
