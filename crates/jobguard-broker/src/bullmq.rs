//! BullMQ adapter. Re-enqueue behaves the same as Bull, but events are
//! consumed via a distinct event-subscriber object (spec.md §4.4) that
//! must be explicitly shut down at dispose — BullMQ's own QueueEvents
//! object is the thing being modeled here.

use std::sync::Arc;

use async_trait::async_trait;
use jobguard_db::{JobRecord, JobStatus, QueueType, Repository};
use jobguard_error::JobGuardError;
use jobguard_logging::Logger;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::base::{
    reenqueue_preamble, sanitize_and_record_failure, wrap_submit_impl, AdapterLimits,
    DisposeGuard, QueueAdapter, ReenqueueOutcome,
};
use crate::contract::{BrokerEvent, QueueBroker};

/// The separate event-subscriber object BullMQ's contract calls for: its
/// own task, cancellable independent of the adapter being dropped.
struct EventSubscriber {
    handle: JoinHandle<()>,
    cancel: watch::Sender<bool>,
}

impl EventSubscriber {
    fn spawn(
        repository: Arc<Repository>,
        queue_name: String,
        logger: Logger,
        mut events: tokio::sync::broadcast::Receiver<BrokerEvent>,
    ) -> Self {
        let (cancel, mut cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            break;
                        }
                    }
                    event = events.recv() => {
                        match event {
                            Ok(BrokerEvent::Active { job_id }) => {
                                if let Err(e) = repository
                                    .update_job_status(&queue_name, QueueType::BullMq, &job_id, JobStatus::Processing)
                                    .await
                                {
                                    logger.error(&format!("active transition for {job_id} failed: {e}"));
                                }
                            }
                            Ok(BrokerEvent::Completed { job_id }) => {
                                if let Err(e) = repository
                                    .update_job_status(&queue_name, QueueType::BullMq, &job_id, JobStatus::Completed)
                                    .await
                                {
                                    logger.error(&format!("completed transition for {job_id} failed: {e}"));
                                }
                            }
                            Ok(BrokerEvent::Failed { job_id, reason }) => {
                                sanitize_and_record_failure(&repository, &queue_name, QueueType::BullMq, &job_id, &reason, &logger).await;
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                logger.warn(&format!("event subscriber lagged, dropped {n} events"));
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });
        Self { handle, cancel }
    }

    fn shutdown(self) {
        let _ = self.cancel.send(true);
        self.handle.abort();
    }
}

pub struct BullMqAdapter<B: QueueBroker> {
    broker: Arc<B>,
    repository: Arc<Repository>,
    queue_name: String,
    limits: AdapterLimits,
    logger: Logger,
    event_subscriber: Mutex<Option<EventSubscriber>>,
    dispose_guard: DisposeGuard,
}

impl<B: QueueBroker + 'static> BullMqAdapter<B> {
    pub fn new(
        broker: Arc<B>,
        repository: Arc<Repository>,
        queue_name: String,
        limits: AdapterLimits,
        logger: Logger,
    ) -> Self {
        let event_subscriber = EventSubscriber::spawn(
            repository.clone(),
            queue_name.clone(),
            logger.clone(),
            broker.subscribe(),
        );
        Self {
            broker,
            repository,
            queue_name,
            limits,
            logger,
            event_subscriber: Mutex::new(Some(event_subscriber)),
            dispose_guard: DisposeGuard::new(),
        }
    }
}

#[async_trait]
impl<B: QueueBroker + 'static> QueueAdapter for BullMqAdapter<B> {
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
            QueueType::BullMq,
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
            QueueType::BullMq,
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
            .mark_reenqueued(&self.queue_name, QueueType::BullMq, &record.job_id)
            .await?;
        Ok(ReenqueueOutcome::Reenqueued)
    }

    async fn heartbeat(&self, job_id: &str) -> bool {
        self.repository
            .update_heartbeat(&self.queue_name, QueueType::BullMq, job_id)
            .await
            .unwrap_or(false)
    }

    async fn dispose(&self) {
        if !self.dispose_guard.mark_disposed() {
            return;
        }
        if let Some(subscriber) = self.event_subscriber.lock().await.take() {
            subscriber.shutdown();
        }
    }
}
