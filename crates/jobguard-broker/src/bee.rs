//! Bee adapter. Bee-Queue cannot honor an externally chosen job id, so
//! re-enqueue creates a brand-new broker job and marks the stuck record
//! `failed` rather than `pending` — preserving the active-uniqueness
//! invariant at the cost of losing the `stuck → dead` partitioning for
//! exhausted jobs. The source always marks it `failed` regardless of
//! remaining attempts; this is a documented limitation, not a bug fix
//! (spec.md §9's open question — implemented literally, per instruction
//! not to guess a "corrected" behavior).

use std::sync::Arc;

use async_trait::async_trait;
use jobguard_db::{JobRecord, JobStatus, QueueType, Repository};
use jobguard_error::JobGuardError;
use jobguard_logging::Logger;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::base::{
    reenqueue_preamble, spawn_event_loop, wrap_submit_impl, AdapterLimits, DisposeGuard,
    QueueAdapter, ReenqueueOutcome,
};
use crate::contract::QueueBroker;

pub struct BeeAdapter<B: QueueBroker> {
    broker: Arc<B>,
    repository: Arc<Repository>,
    queue_name: String,
    limits: AdapterLimits,
    logger: Logger,
    events_task: Mutex<Option<JoinHandle<()>>>,
    dispose_guard: DisposeGuard,
}

impl<B: QueueBroker + 'static> BeeAdapter<B> {
    pub fn new(
        broker: Arc<B>,
        repository: Arc<Repository>,
        queue_name: String,
        limits: AdapterLimits,
        logger: Logger,
    ) -> Self {
        let events_task = spawn_event_loop(
            repository.clone(),
            queue_name.clone(),
            QueueType::Bee,
            broker.subscribe(),
            logger.clone(),
        );
        Self {
            broker,
            repository,
            queue_name,
            limits,
            logger,
            events_task: Mutex::new(Some(events_task)),
            dispose_guard: DisposeGuard::new(),
        }
    }
}

#[async_trait]
impl<B: QueueBroker + 'static> QueueAdapter for BeeAdapter<B> {
    async fn wrap_submit(
        &self,
        job_name: Option<String>,
        data: Value,
        max_attempts: i32,
    ) -> Result<String, JobGuardError> {
        // Bee job kinds have no name; callers that pass one anyway still
        // get the shared validation, they just never see it persisted.
        wrap_submit_impl(
            self.broker.as_ref(),
            &self.repository,
            &self.queue_name,
            QueueType::Bee,
            &self.limits,
            &self.logger,
            job_name,
            data,
            max_attempts,
        )
        .await
    }

    async fn re_enqueue(&self, record: &JobRecord) -> Result<ReenqueueOutcome, JobGuardError> {
        let proceed = reenqueue_preamble(
            self.broker.as_ref(),
            &self.repository,
            &self.queue_name,
            QueueType::Bee,
            record,
        )
        .await?;
        if !proceed {
            return Ok(ReenqueueOutcome::Skipped);
        }

        let new_job_id = self
            .broker
            .submit(record.job_name.as_deref(), record.data.clone())
            .await?;
        self.repository
            .update_job_status(&self.queue_name, QueueType::Bee, &record.job_id, JobStatus::Failed)
            .await?;
        Ok(ReenqueueOutcome::BeeReplaced { new_job_id })
    }

    async fn heartbeat(&self, job_id: &str) -> bool {
        self.repository
            .update_heartbeat(&self.queue_name, QueueType::Bee, job_id)
            .await
            .unwrap_or(false)
    }

    async fn dispose(&self) {
        if !self.dispose_guard.mark_disposed() {
            return;
        }
        if let Some(handle) = self.events_task.lock().await.take() {
            handle.abort();
        }
    }
}
