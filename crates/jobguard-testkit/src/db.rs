//! Live-database test fixture, modeled on `mqk_db::testkit_db_pool`: connect
//! from the env var, run migrations, hand back a ready `Repository`. Every
//! scenario test that needs Postgres calls this and skips gracefully when
//! the env var is absent.

use std::sync::Arc;

use jobguard_circuit::{CircuitBreaker, CircuitBreakerConfig};
use jobguard_db::{ConnectionManager, ConnectionManagerConfig, Repository, ENV_DB_URL};
use jobguard_error::JobGuardError;
use jobguard_logging::{Logger, LoggingConfig};

/// `None` when `JOBGUARD_DATABASE_URL` isn't set — callers should skip the
/// test rather than fail it.
pub fn database_url() -> Option<String> {
    std::env::var(ENV_DB_URL).ok()
}

/// Connects, migrates, and wraps a fresh `Repository` with its own circuit
/// breaker so one test's failures can't trip another's breaker.
pub async fn test_repository(url: &str) -> Result<Repository, JobGuardError> {
    let logger = Logger::new(&LoggingConfig::default());
    let manager = ConnectionManager::connect(ConnectionManagerConfig::from_url(url), logger).await?;
    manager.migrate().await?;
    Ok(Repository::new(
        manager.pool().clone(),
        Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
    ))
}
