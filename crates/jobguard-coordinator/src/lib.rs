//! jobguard-coordinator
//!
//! The top-level facade (spec.md §4.10): wires logger → connection manager →
//! circuit breaker → repository → adapter → reconciler, starts the cleanup
//! timer, and exposes the small public surface a hosting process drives
//! (`stats`, `force_reconciliation`, `heartbeat`, `shutdown`). Grounded in
//! `mqk-daemon::state::AppState` — a `Clone`-via-`Arc` struct wiring
//! sub-components together — and `mqk-db`'s `connect_from_env`/probe-on-
//! startup pattern.

pub mod config;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use jobguard_broker::{build_adapter, QueueAdapter, QueueBroker};
use jobguard_circuit::{CircuitBreaker, CircuitBreakerConfig};
use jobguard_db::{ConnectionManager, Repository, StatusCounts};
use jobguard_error::JobGuardError;
use jobguard_logging::Logger;
use jobguard_reconcile::Reconciler;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub use config::{JobGuardConfig, PersistenceConfig};
/// Installs a process-global `tracing` subscriber for hosting processes that
/// want one — matches `mqk-daemon::main::init_tracing`'s `RUST_LOG`-driven
/// `EnvFilter` setup.
pub use jobguard_logging::init_tracing;

/// Serializes `Coordinator::create` calls process-wide so two concurrent
/// `create`s (e.g. against the same DSN during a hosting process's own
/// startup race) don't run `migrate()` against each other (spec.md §4.10's
/// "single in-flight initialization promise").
static INIT_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn init_lock() -> &'static Mutex<()> {
    INIT_LOCK.get_or_init(|| Mutex::new(()))
}

const CLEANUP_QUARANTINE_THRESHOLD: u32 = 3;

struct CleanupTask {
    handle: JoinHandle<()>,
}

/// The durability-pipeline facade. One instance per queue per process.
pub struct Coordinator {
    connection: Arc<ConnectionManager>,
    repository: Arc<Repository>,
    adapter: Arc<dyn QueueAdapter>,
    reconciler: Arc<Reconciler>,
    queue_name: String,
    queue_type: jobguard_db::QueueType,
    cleanup: Mutex<Option<CleanupTask>>,
    shut_down: AtomicBool,
}

impl Coordinator {
    /// Async initialization (spec.md §4.10): DB probe, adapter wiring,
    /// reconciler start, cleanup timer start. Returns a ready instance.
    pub async fn create<B: QueueBroker + 'static>(
        broker: Arc<B>,
        config: JobGuardConfig,
    ) -> Result<Arc<Self>, JobGuardError> {
        let _guard = init_lock().lock().await;

        let logger = Logger::new(&config.logging);
        let connection = Arc::new(ConnectionManager::connect(config.postgres, logger.clone()).await?);
        connection.migrate().await?;
        connection.test_connection().await?;

        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
        let repository = Arc::new(Repository::new(connection.pool().clone(), breaker));

        let adapter = build_adapter(
            config.queue_type,
            broker,
            repository.clone(),
            config.queue_name.clone(),
            config.limits,
            logger.clone(),
        );

        let reconciler = Reconciler::new(
            repository.clone(),
            adapter.clone(),
            config.queue_name.clone(),
            config.reconciliation,
            logger.clone(),
        )?;
        reconciler.start().await;

        let coordinator = Arc::new(Self {
            connection,
            repository,
            adapter,
            reconciler,
            queue_name: config.queue_name,
            queue_type: config.queue_type,
            cleanup: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        if config.persistence.cleanup_enabled {
            coordinator
                .spawn_cleanup(
                    config.persistence.retention_days,
                    config.persistence.cleanup_interval,
                    logger,
                )
                .await;
        }

        Ok(coordinator)
    }

    async fn spawn_cleanup(
        self: &Arc<Self>,
        retention_days: i64,
        interval: std::time::Duration,
        logger: Logger,
    ) {
        let failures = Arc::new(AtomicU32::new(0));
        let repository = self.repository.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if failures.load(Ordering::SeqCst) >= CLEANUP_QUARANTINE_THRESHOLD {
                    logger.warn("cleanup task is self-quarantined after 3 consecutive failures");
                    continue;
                }
                match repository.delete_old_jobs(retention_days).await {
                    Ok(deleted) => {
                        failures.store(0, Ordering::SeqCst);
                        if deleted > 0 {
                            logger.info(&format!("cleanup removed {deleted} terminal rows"));
                        }
                    }
                    Err(e) => {
                        let n = failures.fetch_add(1, Ordering::SeqCst) + 1;
                        logger.error(&format!("cleanup cycle failed ({n} consecutive): {e}"));
                    }
                }
            }
        });
        *self.cleanup.lock().await = Some(CleanupTask { handle });
    }

    /// The decorator-wrapped broker handle (spec.md §9: "a thin wrapper
    /// object the host constructs around the broker", here owned by the
    /// coordinator instead). The hosting process submits jobs through this,
    /// not through the raw broker — that's what makes every submission
    /// observed by the durability pipeline.
    pub fn adapter(&self) -> Arc<dyn QueueAdapter> {
        self.adapter.clone()
    }

    /// Per-status counts for the configured queue (spec.md §6).
    pub async fn stats(&self) -> Result<StatusCounts, JobGuardError> {
        self.repository.get_statistics(&self.queue_name).await
    }

    /// Runs one reconciliation cycle immediately, bypassing the timer.
    pub async fn force_reconciliation(&self) {
        self.reconciler.force_run().await;
    }

    /// Delegated to the repository (spec.md §6).
    pub async fn heartbeat(&self, job_id: &str) -> bool {
        self.repository
            .update_heartbeat(&self.queue_name, self.queue_type, job_id)
            .await
            .unwrap_or(false)
    }

    /// Tears down timers, disposes the adapter, closes the pool. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.reconciler.stop().await;
        if let Some(cleanup) = self.cleanup.lock().await.take() {
            cleanup.handle.abort();
        }
        self.adapter.dispose().await;
        self.connection.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_quarantine_threshold_matches_reconciler() {
        assert_eq!(CLEANUP_QUARANTINE_THRESHOLD, 3);
    }
}
