//! Bull adapter: re-submits under the broker-assigned `job_id` on
//! re-enqueue, same as BullMQ. Events are consumed on a plain background
//! task; Bull has no distinct event-subscriber object to manage.

use std::sync::Arc;

use async_trait::async_trait;
use jobguard_db::{JobRecord, QueueType, Repository};
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

pub struct BullAdapter<B: QueueBroker> {
    broker: Arc<B>,
    repository: Arc<Repository>,
    queue_name: String,
    limits: AdapterLimits,
    logger: Logger,
    events_task: Mutex<Option<JoinHandle<()>>>,
    dispose_guard: DisposeGuard,
}

impl<B: QueueBroker + 'static> BullAdapter<B> {
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
            QueueType::Bull,
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
impl<B: QueueBroker + 'static> QueueAdapter for BullAdapter<B> {
    async fn wrap_submit(
        &self,
        job_name: Option<String>,
        data: Value,
        max_attempts: i32,
    ) -> Result<String, JobGuardError> {
        wrap_submit_impl(
            self.broker.as_ref(),
            &self.repository,
            &self.queue_name,
            QueueType::Bull,
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
            QueueType::Bull,
            record,
        )
        .await?;
        if !proceed {
            return Ok(ReenqueueOutcome::Skipped);
        }

        self.broker
            .resubmit_with_id(&record.job_id, record.job_name.as_deref(), record.data.clone())
            .await?;
        self.repository
            .mark_reenqueued(&self.queue_name, QueueType::Bull, &record.job_id)
            .await?;
        Ok(ReenqueueOutcome::Reenqueued)
    }

    async fn heartbeat(&self, job_id: &str) -> bool {
        self.repository
            .update_heartbeat(&self.queue_name, QueueType::Bull, job_id)
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
