//! jobguard-reconcile
//!
//! The periodic stuck-job recovery loop (spec.md §4.8): a single-shot timer
//! rescheduled after each cycle, self-quarantining after three consecutive
//! failures, feeding outcomes back into the adaptive scheduler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jobguard_broker::QueueAdapter;
use jobguard_db::Repository;
use jobguard_error::JobGuardError;
use jobguard_logging::Logger;
use jobguard_scheduler::{AdaptiveScheduler, CycleOutcome, SchedulerConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// `reconciliation.*` (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    pub enabled: bool,
    #[serde(with = "duration_millis")]
    pub base_interval: Duration,
    #[serde(with = "duration_millis")]
    pub stuck_threshold: Duration,
    pub batch_size: i64,
    pub adaptive_scheduling: bool,
    pub rate_limit_per_second: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_interval: Duration::from_millis(30_000),
            stuck_threshold: Duration::from_millis(300_000),
            batch_size: 100,
            adaptive_scheduling: true,
            rate_limit_per_second: 20,
        }
    }
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

/// `stuckThresholdMs` hard floor (spec.md §4.5, §8): lower values would
/// mark healthy jobs stuck.
const STUCK_THRESHOLD_FLOOR: Duration = Duration::from_millis(60_000);

const QUARANTINE_THRESHOLD: u32 = 3;

struct Inner {
    scheduler: AdaptiveScheduler,
    consecutive_failures: u32,
    timer: Option<JoinHandle<()>>,
}

/// One instance per queue per process (spec.md §4.8). Held behind an `Arc`
/// so the self-rescheduling timer task can call back into it.
pub struct Reconciler {
    repository: Arc<Repository>,
    adapter: Arc<dyn QueueAdapter>,
    queue_name: String,
    config: ReconcilerConfig,
    logger: Logger,
    inner: Mutex<Inner>,
    /// Serializes cycle execution so a `forceRun()` racing the scheduled
    /// timer never overlaps it (spec.md §5's `isRunning` guard).
    cycle_lock: Mutex<()>,
    running: AtomicBool,
}

impl Reconciler {
    pub fn new(
        repository: Arc<Repository>,
        adapter: Arc<dyn QueueAdapter>,
        queue_name: String,
        config: ReconcilerConfig,
        logger: Logger,
    ) -> Result<Arc<Self>, JobGuardError> {
        if config.stuck_threshold < STUCK_THRESHOLD_FLOOR {
            return Err(JobGuardError::reconciliation(JobGuardError::validation(
                format!(
                    "stuckThresholdMs must be >= {} ({} given)",
                    STUCK_THRESHOLD_FLOOR.as_millis(),
                    config.stuck_threshold.as_millis()
                ),
            )));
        }

        let scheduler = AdaptiveScheduler::new(SchedulerConfig {
            base_interval: config.base_interval,
        });

        Ok(Arc::new(Self {
            repository,
            adapter,
            queue_name,
            config,
            logger,
            inner: Mutex::new(Inner {
                scheduler,
                consecutive_failures: 0,
                timer: None,
            }),
            cycle_lock: Mutex::new(()),
            running: AtomicBool::new(false),
        }))
    }

    /// Schedules the first cycle after `base_interval`. A no-op if disabled
    /// or already running.
    pub async fn start(self: &Arc<Self>) {
        if !self.config.enabled || self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.schedule_next(self.config.base_interval);
    }

    /// Cancels the pending timer; future cycles do not fire. A cycle
    /// already in flight is allowed to finish.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.inner.lock().await.timer.take() {
            handle.abort();
        }
    }

    /// Resets the consecutive-failure counter and runs a cycle immediately,
    /// clearing self-quarantine.
    pub async fn force_run(self: &Arc<Self>) {
        self.inner.lock().await.consecutive_failures = 0;
        self.run_cycle().await;
    }

    fn schedule_next(self: &Arc<Self>, delay: Duration) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.run_cycle().await;
            if this.running.load(Ordering::SeqCst) {
                let next = this.inner.lock().await.scheduler.current_interval();
                this.schedule_next(next);
            }
        });
        let this = self.clone();
        tokio::spawn(async move {
            this.inner.lock().await.timer = Some(handle);
        });
    }

    async fn run_cycle(self: &Arc<Self>) {
        let _cycle_guard = self.cycle_lock.lock().await;

        {
            let inner = self.inner.lock().await;
            if inner.consecutive_failures >= QUARANTINE_THRESHOLD {
                self.logger.warn(&format!(
                    "reconciler for {} is self-quarantined after {} consecutive failures; skipping cycle",
                    self.queue_name, inner.consecutive_failures
                ));
                return;
            }
        }

        let harvest = match self
            .repository
            .get_and_mark_stuck_jobs(
                &self.queue_name,
                self.config.stuck_threshold.as_millis() as i64,
                self.config.batch_size,
            )
            .await
        {
            Ok(h) => h,
            Err(e) => {
                let mut inner = self.inner.lock().await;
                inner.consecutive_failures += 1;
                self.logger.error(&format!(
                    "reconciliation cycle for {} failed ({} consecutive): {}",
                    self.queue_name, inner.consecutive_failures, e
                ));
                return;
            }
        };

        let total_to_reenqueue = harvest.to_reenqueue.len();
        let mut reenqueued = 0usize;
        let spacing = Duration::from_millis(
            (1000 / self.config.rate_limit_per_second.max(1)) as u64,
        );

        for (idx, record) in harvest.to_reenqueue.iter().enumerate() {
            match self.adapter.re_enqueue(record).await {
                Ok(_) => reenqueued += 1,
                Err(e) => self.logger.error(&format!(
                    "re-enqueue failed for job {}: {}",
                    record.job_id, e
                )),
            }
            if idx + 1 < total_to_reenqueue {
                tokio::time::sleep(spacing).await;
            }
        }

        let success_rate = if total_to_reenqueue == 0 {
            1.0
        } else {
            reenqueued as f64 / total_to_reenqueue as f64
        };
        let found = total_to_reenqueue as u64 + harvest.dead_ids.len() as u64;

        let mut inner = self.inner.lock().await;
        inner.consecutive_failures = 0;
        if self.config.adaptive_scheduling {
            inner.scheduler.next_interval(CycleOutcome {
                found_stuck_jobs: found,
                success_rate,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ReconcilerConfig {
        ReconcilerConfig {
            stuck_threshold: Duration::from_millis(60_000),
            ..ReconcilerConfig::default()
        }
    }

    #[test]
    fn threshold_below_floor_is_rejected_at_construction() {
        let config = ReconcilerConfig {
            stuck_threshold: Duration::from_millis(30_000),
            ..base_config()
        };
        // Construction needs a repository and adapter; the floor check runs
        // before either is touched, so bogus placeholders never get used.
        let err = validate_threshold(&config).unwrap_err();
        assert!(err.to_string().contains("stuckThresholdMs"));
    }

    #[test]
    fn threshold_at_floor_is_accepted() {
        assert!(validate_threshold(&base_config()).is_ok());
    }

    /// Mirrors the floor check inside `Reconciler::new` without requiring a
    /// live repository/adapter pair, so the boundary behavior (spec.md §8)
    /// is covered by a pure unit test.
    fn validate_threshold(config: &ReconcilerConfig) -> Result<(), JobGuardError> {
        if config.stuck_threshold < STUCK_THRESHOLD_FLOOR {
            return Err(JobGuardError::reconciliation(JobGuardError::validation(
                format!(
                    "stuckThresholdMs must be >= {} ({} given)",
                    STUCK_THRESHOLD_FLOOR.as_millis(),
                    config.stuck_threshold.as_millis()
                ),
            )));
        }
        Ok(())
    }
}
