//! Shared adapter lifecycle (spec.md §4.4): payload validation, the
//! submit-then-persist sequence, the broker-event consumer loop, and the
//! re-enqueue re-verify/atomic-remove preamble common to every broker
//! family. The three family-specific adapters in `bull`, `bullmq`, and
//! `bee` each build on these free functions rather than duplicating them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use jobguard_db::{JobRecord, JobStatus, QueueType, Repository};
use jobguard_error::JobGuardError;
use jobguard_logging::Logger;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::contract::{BrokerEvent, QueueBroker};
use crate::sanitize::sanitize_error;

/// `limits.{maxJobDataSize,maxJobNameLength}` (spec.md §6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdapterLimits {
    pub max_job_data_size: usize,
    pub max_job_name_length: usize,
}

impl Default for AdapterLimits {
    fn default() -> Self {
        Self {
            max_job_data_size: 1_048_576,
            max_job_name_length: 255,
        }
    }
}

/// The capability set every broker-family adapter exposes (spec.md §4.4).
/// Object-safe so `jobguard-coordinator` and `jobguard-reconcile` can hold
/// `Arc<dyn QueueAdapter>` without knowing which broker family it wraps.
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    async fn wrap_submit(
        &self,
        job_name: Option<String>,
        data: Value,
        max_attempts: i32,
    ) -> Result<String, JobGuardError>;

    async fn re_enqueue(&self, record: &JobRecord) -> Result<ReenqueueOutcome, JobGuardError>;

    /// Heartbeat failures are swallowed by contract (spec.md §7) — a missed
    /// heartbeat only risks a premature stuck classification.
    async fn heartbeat(&self, job_id: &str) -> bool;

    /// Restores the original submit, detaches listeners, closes any event
    /// subscriber, marks self disposed. Idempotent.
    async fn dispose(&self);
}

#[derive(Debug, Clone)]
pub enum ReenqueueOutcome {
    /// Re-submitted under the same job id and moved back to `pending`.
    Reenqueued,
    /// Skipped: the worker had already progressed the job, or the broker
    /// had already resolved it before the atomic removal ran.
    Skipped,
    /// Bee cannot honor externally chosen ids — a new job was created and
    /// the stuck record was marked `failed` instead of `pending`.
    BeeReplaced { new_job_id: String },
}

/// `job_name` length and serialized `data` size (spec.md §4.4's `wrap-submit`
/// validation). A validation failure surfaces to the caller; the submit
/// never reaches the broker.
pub fn validate_submission(
    job_name: Option<&str>,
    data: &Value,
    limits: &AdapterLimits,
) -> Result<(), JobGuardError> {
    if let Some(name) = job_name {
        if name.chars().count() > limits.max_job_name_length {
            return Err(JobGuardError::validation(format!(
                "job_name exceeds {} characters",
                limits.max_job_name_length
            )));
        }
    }

    let serialized = serde_json::to_vec(data)
        .map_err(|e| JobGuardError::validation(format!("payload not serializable: {e}")))?;
    if serialized.len() > limits.max_job_data_size {
        return Err(JobGuardError::validation(format!(
            "payload exceeds {} bytes",
            limits.max_job_data_size
        )));
    }

    Ok(())
}

/// `wrap-submit`: intercept, forward to the broker, then persist. A DB
/// failure here is logged, never surfaced — the job already exists in the
/// broker (spec.md §4.4, §7).
pub async fn wrap_submit_impl<B: QueueBroker>(
    broker: &B,
    repository: &Repository,
    queue_name: &str,
    queue_type: QueueType,
    limits: &AdapterLimits,
    logger: &Logger,
    job_name: Option<String>,
    data: Value,
    max_attempts: i32,
) -> Result<String, JobGuardError> {
    validate_submission(job_name.as_deref(), &data, limits)?;

    let job_id = broker.submit(job_name.as_deref(), data.clone()).await?;

    if let Err(e) = repository
        .insert_job(
            queue_name,
            queue_type,
            &job_id,
            job_name.as_deref(),
            data,
            max_attempts,
        )
        .await
    {
        logger.error(&format!(
            "insertJob after successful broker submit failed for job {job_id}: {e}"
        ));
    }

    Ok(job_id)
}

/// Steps 1-2 of §4.6's re-enqueue protocol, identical across broker
/// families: re-verify the record is still `stuck`, then ask the broker to
/// atomically remove it only if unprocessed. `Ok(false)` means the caller
/// should skip — another agent already progressed the job.
pub async fn reenqueue_preamble<B: QueueBroker>(
    broker: &B,
    repository: &Repository,
    queue_name: &str,
    queue_type: QueueType,
    record: &JobRecord,
) -> Result<bool, JobGuardError> {
    let current = repository
        .get_job(queue_name, queue_type, &record.job_id)
        .await?;
    let Some(current) = current else {
        return Ok(false);
    };
    if current.status != JobStatus::Stuck {
        return Ok(false);
    }

    broker.atomic_remove_if_unprocessed(&record.job_id).await
}

/// Sanitizes a broker-reported failure reason and records it, logging
/// (never propagating) on a DB error — shared by every family's event
/// consumer.
pub async fn sanitize_and_record_failure(
    repository: &Repository,
    queue_name: &str,
    queue_type: QueueType,
    job_id: &str,
    reason: &str,
    logger: &Logger,
) {
    let sanitized = sanitize_error(reason);
    if let Err(e) = repository
        .update_job_error(queue_name, queue_type, job_id, &sanitized)
        .await
    {
        logger.error(&format!("failed transition for {job_id} failed: {e}"));
    }
}

/// The broker-event consumer task (spec.md §4.4's `attach-events`, §5's
/// "one broker-event consumer task per adapter"). Errors updating status
/// are logged and never propagate into the broker's event loop (spec.md
/// §7's event path policy).
pub fn spawn_event_loop(
    repository: Arc<Repository>,
    queue_name: String,
    queue_type: QueueType,
    mut events: broadcast::Receiver<BrokerEvent>,
    logger: Logger,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(BrokerEvent::Active { job_id }) => {
                    if let Err(e) = repository
                        .update_job_status(&queue_name, queue_type, &job_id, JobStatus::Processing)
                        .await
                    {
                        logger.error(&format!("active transition for {job_id} failed: {e}"));
                    }
                }
                Ok(BrokerEvent::Completed { job_id }) => {
                    if let Err(e) = repository
                        .update_job_status(&queue_name, queue_type, &job_id, JobStatus::Completed)
                        .await
                    {
                        logger.error(&format!("completed transition for {job_id} failed: {e}"));
                    }
                }
                Ok(BrokerEvent::Failed { job_id, reason }) => {
                    sanitize_and_record_failure(&repository, &queue_name, queue_type, &job_id, &reason, &logger).await;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    logger.warn(&format!("event subscriber lagged, dropped {n} events"));
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Disposal bookkeeping shared by every adapter: aborts the event task and
/// flips `disposed`, but only once.
pub struct DisposeGuard {
    disposed: AtomicBool,
}

impl DisposeGuard {
    pub fn new() -> Self {
        Self {
            disposed: AtomicBool::new(false),
        }
    }

    /// Returns `true` the first time it's called; `false` on every
    /// subsequent call, making `dispose` idempotent.
    pub fn mark_disposed(&self) -> bool {
        !self.disposed.swap(true, Ordering::SeqCst)
    }
}

impl Default for DisposeGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_submission_rejects_long_job_name() {
        let limits = AdapterLimits::default();
        let name = "x".repeat(256);
        let err = validate_submission(Some(&name), &json!({}), &limits).unwrap_err();
        assert!(err.to_string().contains("job_name"));
    }

    #[test]
    fn validate_submission_rejects_oversized_payload() {
        let limits = AdapterLimits {
            max_job_data_size: 16,
            max_job_name_length: 255,
        };
        let big = json!({"data": "x".repeat(100)});
        assert!(validate_submission(None, &big, &limits).is_err());
    }

    #[test]
    fn validate_submission_accepts_well_formed_input() {
        let limits = AdapterLimits::default();
        assert!(validate_submission(Some("send-email"), &json!({"to": "a@b.com"}), &limits).is_ok());
    }

    #[test]
    fn dispose_guard_is_idempotent() {
        let guard = DisposeGuard::new();
        assert!(guard.mark_disposed());
        assert!(!guard.mark_disposed());
    }
}
