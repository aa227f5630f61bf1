//! jobguard-error
//!
//! Typed failure taxonomy shared by every durability-pipeline crate.
//!
//! Callers distinguish "back off, the DB surface is overloaded"
//! (`CircuitBreakerOpen`) from "retry later, connectivity is down"
//! (`PostgresConnection`) from "this is a caller mistake" (`Validation`,
//! `UnsupportedQueue`) — see spec.md §7 for the propagation policy each
//! variant implies.

use thiserror::Error;

/// The error surface every public, boundary-facing operation returns.
///
/// Internal plumbing inside `jobguard-db` still uses `anyhow::Result` with
/// `.context(...)` for ad-hoc query failures; only operations that cross a
/// component boundary described in spec.md §7 are converted to this type.
#[derive(Debug, Error)]
pub enum JobGuardError {
    /// The circuit breaker is `Open`; the DB surface is fail-fast.
    #[error("circuit breaker open: {detail}")]
    CircuitBreakerOpen { detail: String },

    /// A connectivity failure, or the pool is critically exhausted. The
    /// latter has no underlying `sqlx::Error` to wrap — `source` is `None`
    /// and `detail` carries the pool-health explanation instead.
    #[error("postgres connection error: {detail}")]
    PostgresConnection {
        detail: String,
        #[source]
        source: Option<sqlx::Error>,
    },

    /// Adapter selection failed at construction — fatal, no matching broker
    /// family could be resolved for the configured `queue_type`.
    #[error("unsupported queue: {detail}")]
    UnsupportedQueue { detail: String },

    /// An error escaped from a reconciliation cycle. Wraps the underlying
    /// cause; the reconciler records it and self-quarantines after three in
    /// a row (spec.md §4.8).
    #[error("reconciliation error: {source}")]
    Reconciliation {
        #[source]
        source: Box<JobGuardError>,
    },

    /// Payload too large, job name too long, or payload unserializable.
    #[error("validation error: {detail}")]
    Validation { detail: String },
}

impl JobGuardError {
    pub fn circuit_open(detail: impl Into<String>) -> Self {
        Self::CircuitBreakerOpen {
            detail: detail.into(),
        }
    }

    pub fn postgres(source: sqlx::Error) -> Self {
        Self::PostgresConnection {
            detail: source.to_string(),
            source: Some(source),
        }
    }

    /// A pool-health failure with no originating `sqlx::Error` — e.g. the
    /// exhaustion detector tripping after sustained zero-idle samples.
    pub fn pool_exhausted(detail: impl Into<String>) -> Self {
        Self::PostgresConnection {
            detail: detail.into(),
            source: None,
        }
    }

    pub fn unsupported_queue(detail: impl Into<String>) -> Self {
        Self::UnsupportedQueue {
            detail: detail.into(),
        }
    }

    pub fn reconciliation(source: JobGuardError) -> Self {
        Self::Reconciliation {
            source: Box::new(source),
        }
    }

    pub fn validation(detail: impl Into<String>) -> Self {
        Self::Validation {
            detail: detail.into(),
        }
    }

    /// `true` for errors a caller may reasonably retry after a delay
    /// (`CircuitBreakerOpen`, `PostgresConnection`); `false` for errors that
    /// indicate a caller mistake and will not resolve by retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobGuardError::CircuitBreakerOpen { .. } | JobGuardError::PostgresConnection { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, JobGuardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_breaker_open_is_retryable() {
        assert!(JobGuardError::circuit_open("probe pending").is_retryable());
    }

    #[test]
    fn validation_is_not_retryable() {
        assert!(!JobGuardError::validation("job name too long").is_retryable());
    }

    #[test]
    fn reconciliation_wraps_cause_message() {
        let inner = JobGuardError::validation("bad payload");
        let wrapped = JobGuardError::reconciliation(inner);
        assert!(wrapped.to_string().contains("bad payload"));
    }
}
