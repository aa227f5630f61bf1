//! jobguard-circuit
//!
//! The fail-fast guard wrapping every repository call (spec.md §4.1).
//!
//! `CLOSED -> OPEN -> HALF_OPEN -> CLOSED`: on success, the consecutive
//! failure count resets and a `HalfOpen` probe promotes the breaker to
//! `Closed`; on failure, the count increments and the breaker opens once it
//! reaches the configured threshold. While `Open`, calls fail immediately
//! with `CircuitBreakerError::Open` until the recovery timeout has elapsed,
//! at which point exactly one probe is admitted.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// How long the breaker stays `Open` before admitting a probe.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

const METRICS_WINDOW: Duration = Duration::from_secs(60);

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    last_failure_utc: Option<DateTime<Utc>>,
    /// `true` while an admitted `HalfOpen` probe is in flight; guards
    /// against admitting a second concurrent probe.
    probe_in_flight: bool,
    /// Sliding 60s window of `(success, timestamp)` for metrics only —
    /// never consulted for state transitions.
    window: VecDeque<(bool, Instant)>,
}

/// The error `execute` returns: either the breaker refused the call, or the
/// wrapped operation itself failed.
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    Open,
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::Open => write!(f, "circuit breaker open"),
            CircuitBreakerError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for CircuitBreakerError<E> {}

#[derive(Debug, Clone)]
pub struct CircuitMetrics {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub windowed_call_total: usize,
    pub windowed_failure_rate_pct: f64,
    pub last_failure_at: Option<DateTime<Utc>>,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                last_failure_utc: None,
                probe_in_flight: false,
                window: VecDeque::new(),
            }),
        }
    }

    /// Run `op` through the breaker. Returns `CircuitBreakerError::Open`
    /// without invoking `op` at all when the breaker refuses the call.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.admit().await?;
        match op().await {
            Ok(v) => {
                self.record_success().await;
                Ok(v)
            }
            Err(e) => {
                self.record_failure().await;
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    async fn admit<E>(&self) -> Result<(), CircuitBreakerError<E>> {
        let mut inner = self.inner.lock().await;
        prune_window(&mut inner.window);
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let past_recovery = inner
                    .last_failure_at
                    .map(|t| t.elapsed() > self.config.recovery_timeout)
                    .unwrap_or(true);
                if past_recovery {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(CircuitBreakerError::Open)
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(CircuitBreakerError::Open)
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.window.push_back((true, now));
        prune_window(&mut inner.window);
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
        }
    }

    async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.window.push_back((false, now));
        prune_window(&mut inner.window);
        inner.consecutive_failures += 1;
        inner.last_failure_at = Some(now);
        inner.last_failure_utc = Some(Utc::now());
        let was_probe = inner.probe_in_flight;
        inner.probe_in_flight = false;

        if was_probe {
            // A failed half-open probe reopens the circuit immediately,
            // independent of the consecutive-failure threshold.
            inner.state = CircuitState::Open;
        } else if inner.consecutive_failures >= self.config.failure_threshold {
            inner.state = CircuitState::Open;
        }
    }

    pub async fn metrics(&self) -> CircuitMetrics {
        let mut inner = self.inner.lock().await;
        prune_window(&mut inner.window);
        let total = inner.window.len();
        let failures = inner.window.iter().filter(|(ok, _)| !ok).count();
        let rate = if total == 0 {
            0.0
        } else {
            (failures as f64 / total as f64) * 100.0
        };
        CircuitMetrics {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            windowed_call_total: total,
            windowed_failure_rate_pct: rate,
            last_failure_at: inner.last_failure_utc,
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }
}

fn prune_window(window: &mut VecDeque<(bool, Instant)>) {
    let cutoff = Instant::now();
    while let Some((_, ts)) = window.front() {
        if cutoff.duration_since(*ts) > METRICS_WINDOW {
            window.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn cfg(threshold: u32, recovery: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: recovery,
        }
    }

    #[tokio::test]
    async fn closed_admits_and_tracks_success() {
        let cb = CircuitBreaker::new(cfg(3, Duration::from_millis(10)));
        let res: Result<i32, CircuitBreakerError<&str>> = cb.execute(|| async { Ok(1) }).await;
        assert!(res.is_ok());
        let m = cb.metrics().await;
        assert_eq!(m.state, CircuitState::Closed);
        assert_eq!(m.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let cb = CircuitBreaker::new(cfg(3, Duration::from_secs(30)));
        for _ in 0..3 {
            let _: Result<i32, CircuitBreakerError<&str>> = cb.execute(|| async { Err("boom") }).await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);
        let res: Result<i32, CircuitBreakerError<&str>> = cb.execute(|| async { Ok(1) }).await;
        assert!(matches!(res, Err(CircuitBreakerError::Open)));
    }

    #[tokio::test]
    async fn half_open_probe_closes_on_success_after_recovery() {
        let cb = CircuitBreaker::new(cfg(1, Duration::from_millis(5)));
        let _: Result<i32, CircuitBreakerError<&str>> = cb.execute(|| async { Err("boom") }).await;
        assert_eq!(cb.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;

        let res: Result<i32, CircuitBreakerError<&str>> = cb.execute(|| async { Ok(1) }).await;
        assert!(res.is_ok());
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens_immediately() {
        let cb = CircuitBreaker::new(cfg(5, Duration::from_millis(5)));
        let _: Result<i32, CircuitBreakerError<&str>> = cb.execute(|| async { Err("boom") }).await;
        // consecutive_failures == 1, below threshold of 5 — still Closed here
        // until we push past the threshold explicitly below. Force open by
        // direct repeated failures to exercise the half-open path cleanly.
        for _ in 0..4 {
            let _: Result<i32, CircuitBreakerError<&str>> = cb.execute(|| async { Err("boom") }).await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;

        let res: Result<i32, CircuitBreakerError<&str>> = cb.execute(|| async { Err("still broken") }).await;
        assert!(matches!(res, Err(CircuitBreakerError::Inner(_))));
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn only_one_probe_admitted_while_half_open() {
        let cb = CircuitBreaker::new(cfg(1, Duration::from_millis(5)));
        let _: Result<i32, CircuitBreakerError<&str>> = cb.execute(|| async { Err("boom") }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Admit the probe but never let it resolve-through-record by calling
        // admit() directly is not public; instead exercise via two
        // concurrently-dispatched calls and confirm only one could run.
        let concurrent_runs = AtomicU32::new(0);
        let cb_ref = &cb;
        let counter = &concurrent_runs;
        let a = async {
            cb_ref
                .execute(|| async {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok::<_, &str>(1)
                })
                .await
        };
        let b = async {
            // Give `a` a head start to win the single-probe admission.
            tokio::time::sleep(Duration::from_millis(5)).await;
            cb_ref.execute(|| async { Ok::<_, &str>(2) }).await
        };
        let (ra, rb) = tokio::join!(a, b);
        assert!(ra.is_ok());
        assert!(matches!(rb, Err(CircuitBreakerError::Open)));
    }

    #[tokio::test]
    async fn metrics_report_windowed_failure_rate() {
        let cb = CircuitBreaker::new(cfg(10, Duration::from_secs(30)));
        let _: Result<i32, CircuitBreakerError<&str>> = cb.execute(|| async { Ok(1) }).await;
        let _: Result<i32, CircuitBreakerError<&str>> = cb.execute(|| async { Err("boom") }).await;
        let m = cb.metrics().await;
        assert_eq!(m.windowed_call_total, 2);
        assert!((m.windowed_failure_rate_pct - 50.0).abs() < f64::EPSILON);
        assert!(m.last_failure_at.is_some());
    }
}
