//! Deterministic in-memory broker, modeled on the teacher's `PaperBroker`:
//! no network I/O, monotonic counters for ids, plain data structures behind
//! a single lock. Good enough to drive every adapter's `wrap-submit` and
//! `re-enqueue` paths without a real Bull/BullMQ/Bee installation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use jobguard_broker::{BrokerEvent, BrokerJobState, QueueBroker};
use jobguard_error::JobGuardError;
use serde_json::Value;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InnerState {
    Unprocessed,
    Finished,
    Failed,
}

impl From<InnerState> for BrokerJobState {
    fn from(s: InnerState) -> Self {
        match s {
            InnerState::Unprocessed => BrokerJobState::Unprocessed,
            InnerState::Finished => BrokerJobState::Finished,
            InnerState::Failed => BrokerJobState::Failed,
        }
    }
}

struct Jobs {
    states: HashMap<String, InnerState>,
}

/// A deterministic fake broker. Tests drive lifecycle transitions directly
/// via [`InMemoryBroker::emit_active`], [`emit_completed`], and
/// [`emit_failed`] — there is no worker loop pulling jobs off a queue.
pub struct InMemoryBroker {
    jobs: Mutex<Jobs>,
    events: broadcast::Sender<BrokerEvent>,
    next_id: AtomicU64,
    submit_count: AtomicU64,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            jobs: Mutex::new(Jobs {
                states: HashMap::new(),
            }),
            events,
            next_id: AtomicU64::new(1),
            submit_count: AtomicU64::new(0),
        }
    }

    pub fn submit_count(&self) -> u64 {
        self.submit_count.load(Ordering::SeqCst)
    }

    pub fn emit_active(&self, job_id: &str) {
        let _ = self.events.send(BrokerEvent::Active {
            job_id: job_id.to_string(),
        });
    }

    pub fn emit_completed(&self, job_id: &str) {
        self.jobs
            .lock()
            .unwrap()
            .states
            .insert(job_id.to_string(), InnerState::Finished);
        let _ = self.events.send(BrokerEvent::Completed {
            job_id: job_id.to_string(),
        });
    }

    pub fn emit_failed(&self, job_id: &str, reason: &str) {
        self.jobs
            .lock()
            .unwrap()
            .states
            .insert(job_id.to_string(), InnerState::Failed);
        let _ = self.events.send(BrokerEvent::Failed {
            job_id: job_id.to_string(),
            reason: reason.to_string(),
        });
    }
}

#[async_trait]
impl QueueBroker for InMemoryBroker {
    async fn submit(&self, _job_name: Option<&str>, _data: Value) -> Result<String, JobGuardError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let job_id = format!("job-{id:06}");
        self.jobs
            .lock()
            .unwrap()
            .states
            .insert(job_id.clone(), InnerState::Unprocessed);
        self.submit_count.fetch_add(1, Ordering::SeqCst);
        Ok(job_id)
    }

    fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    async fn atomic_remove_if_unprocessed(&self, job_id: &str) -> Result<bool, JobGuardError> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.states.get(job_id) {
            Some(InnerState::Unprocessed) => {
                jobs.states.remove(job_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn resubmit_with_id(
        &self,
        job_id: &str,
        _job_name: Option<&str>,
        _data: Value,
    ) -> Result<(), JobGuardError> {
        self.jobs
            .lock()
            .unwrap()
            .states
            .insert(job_id.to_string(), InnerState::Unprocessed);
        self.submit_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_job_state(&self, job_id: &str) -> Result<BrokerJobState, JobGuardError> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs
            .states
            .get(job_id)
            .copied()
            .map(BrokerJobState::from)
            .unwrap_or(BrokerJobState::Absent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submit_assigns_monotonic_ids() {
        let broker = InMemoryBroker::new();
        let a = broker.submit(None, Value::Null).await.unwrap();
        let b = broker.submit(None, Value::Null).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(broker.submit_count(), 2);
    }

    #[tokio::test]
    async fn atomic_remove_only_succeeds_while_unprocessed() {
        let broker = InMemoryBroker::new();
        let id = broker.submit(None, Value::Null).await.unwrap();
        broker.emit_completed(&id);
        assert!(!broker.atomic_remove_if_unprocessed(&id).await.unwrap());

        let id2 = broker.submit(None, Value::Null).await.unwrap();
        assert!(broker.atomic_remove_if_unprocessed(&id2).await.unwrap());
        assert!(!broker.atomic_remove_if_unprocessed(&id2).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_job_state_is_absent() {
        let broker = InMemoryBroker::new();
        assert_eq!(
            broker.get_job_state("never-submitted").await.unwrap(),
            BrokerJobState::Absent
        );
    }
}
