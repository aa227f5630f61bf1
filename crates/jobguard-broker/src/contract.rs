//! The broker-side interface the core consumes (spec.md §6) — not owned by
//! the core. A real adapter wraps a handle to the actual Bull/BullMQ/Bee
//! client; `jobguard-testkit` provides a deterministic in-memory fake for
//! tests.

use async_trait::async_trait;
use jobguard_error::JobGuardError;
use serde_json::Value;
use tokio::sync::broadcast;

/// A lifecycle transition emitted by the broker (spec.md §4.4's
/// `attach-events`: `active`, `completed`, `failed`).
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    Active { job_id: String },
    Completed { job_id: String },
    Failed { job_id: String, reason: String },
}

/// What `get_job_state` reports about a broker-side job, used by the
/// re-enqueue re-verify step (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerJobState {
    Unprocessed,
    Finished,
    Failed,
    Absent,
}

impl BrokerJobState {
    /// `true` when the broker has already resolved the job one way or
    /// another — re-enqueuing on top of this would risk double execution.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BrokerJobState::Finished | BrokerJobState::Failed)
    }
}

/// The thin, broker-family-agnostic surface an adapter drives. Implemented
/// once per broker family (Bull, BullMQ, Bee); `jobguard-testkit` implements
/// it as an in-memory fake for tests.
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Forwards a submission to the broker and returns its assigned job id.
    async fn submit(&self, job_name: Option<&str>, data: Value) -> Result<String, JobGuardError>;

    /// A fresh subscription to the broker's lifecycle event stream.
    fn subscribe(&self) -> broadcast::Receiver<BrokerEvent>;

    /// The broker-side atomic check-and-remove script (spec.md §4.6 step 2):
    /// removes the job's record and indexing entries only if it has no
    /// finished/failed marker yet. Returns `true` iff the removal happened.
    async fn atomic_remove_if_unprocessed(&self, job_id: &str) -> Result<bool, JobGuardError>;

    /// Re-submits a payload under an explicit job id (Bull/BullMQ only —
    /// Bee cannot honor externally chosen ids and never calls this).
    async fn resubmit_with_id(
        &self,
        job_id: &str,
        job_name: Option<&str>,
        data: Value,
    ) -> Result<(), JobGuardError>;

    async fn get_job_state(&self, job_id: &str) -> Result<BrokerJobState, JobGuardError>;
}
