//! jobguard-scheduler
//!
//! Deterministic, pure logic. No IO. No reconciler calls.
//!
//! Computes the reconciler's next cycle interval from the previous cycle's
//! outcome (spec.md §4.7). Three rules, evaluated in order; the first one
//! that applies wins.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// The configured base interval (`reconciliation.intervalMs`).
    pub base_interval: Duration,
}

impl SchedulerConfig {
    fn min_interval(&self) -> Duration {
        std::cmp::max(Duration::from_secs(5), self.base_interval / 4)
    }

    fn max_interval(&self) -> Duration {
        self.base_interval * 4
    }
}

/// What a completed reconciliation cycle reports back to the scheduler.
#[derive(Debug, Clone, Copy)]
pub struct CycleOutcome {
    pub found_stuck_jobs: u64,
    /// Re-enqueued / to-re-enqueue; `1.0` when the denominator is zero.
    pub success_rate: f64,
}

/// Tracks the current interval and the consecutive-empty-cycle streak
/// across calls to `next_interval`.
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveScheduler {
    config: SchedulerConfig,
    current_interval: Duration,
    consecutive_empty: u32,
}

impl AdaptiveScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let current_interval = config.base_interval;
        Self {
            config,
            current_interval,
            consecutive_empty: 0,
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    /// Folds one cycle's outcome into the scheduler's state and returns the
    /// interval to wait before the next cycle.
    pub fn next_interval(&mut self, outcome: CycleOutcome) -> Duration {
        let min = self.config.min_interval();
        let max = self.config.max_interval();

        if outcome.success_rate < 0.8 {
            self.current_interval = scale(self.current_interval, 1.5, min, max);
            return self.current_interval;
        }

        if outcome.found_stuck_jobs == 0 {
            self.consecutive_empty += 1;
            if self.consecutive_empty >= 3 {
                self.current_interval = scale(self.current_interval, 1.5, min, max);
            }
        } else {
            self.consecutive_empty = 0;
            self.current_interval = scale(self.current_interval, 0.8, min, max);
        }

        self.current_interval
    }
}

fn scale(interval: Duration, factor: f64, min: Duration, max: Duration) -> Duration {
    let scaled_nanos = (interval.as_nanos() as f64) * factor;
    let scaled = Duration::from_nanos(scaled_nanos.max(0.0) as u64);
    scaled.clamp(min, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(base_secs: u64) -> SchedulerConfig {
        SchedulerConfig {
            base_interval: Duration::from_secs(base_secs),
        }
    }

    #[test]
    fn low_success_rate_backs_off_regardless_of_found_count() {
        let mut sched = AdaptiveScheduler::new(cfg(30));
        let next = sched.next_interval(CycleOutcome {
            found_stuck_jobs: 5,
            success_rate: 0.5,
        });
        assert_eq!(next, Duration::from_millis(45_000));
    }

    #[test]
    fn empty_cycles_only_back_off_on_the_third_consecutive() {
        let mut sched = AdaptiveScheduler::new(cfg(30));
        let empty = CycleOutcome {
            found_stuck_jobs: 0,
            success_rate: 1.0,
        };
        assert_eq!(sched.next_interval(empty), Duration::from_secs(30));
        assert_eq!(sched.next_interval(empty), Duration::from_secs(30));
        assert_eq!(sched.next_interval(empty), Duration::from_millis(45_000));
    }

    #[test]
    fn nonempty_cycle_speeds_up_and_resets_empty_streak() {
        let mut sched = AdaptiveScheduler::new(cfg(30));
        let empty = CycleOutcome {
            found_stuck_jobs: 0,
            success_rate: 1.0,
        };
        sched.next_interval(empty);
        sched.next_interval(empty);
        let found = CycleOutcome {
            found_stuck_jobs: 3,
            success_rate: 1.0,
        };
        let next = sched.next_interval(found);
        assert_eq!(next, Duration::from_millis(24_000));

        // The empty streak reset means two more empty cycles don't trip the
        // third-consecutive rule yet.
        assert_eq!(sched.next_interval(empty), Duration::from_millis(24_000));
    }

    #[test]
    fn interval_never_exceeds_max_bound() {
        let mut sched = AdaptiveScheduler::new(cfg(30));
        let low = CycleOutcome {
            found_stuck_jobs: 1,
            success_rate: 0.1,
        };
        for _ in 0..20 {
            sched.next_interval(low);
        }
        assert!(sched.current_interval() <= Duration::from_secs(120));
    }

    #[test]
    fn interval_never_drops_below_min_bound() {
        let mut sched = AdaptiveScheduler::new(cfg(30));
        let busy = CycleOutcome {
            found_stuck_jobs: 10,
            success_rate: 1.0,
        };
        for _ in 0..20 {
            sched.next_interval(busy);
        }
        assert!(sched.current_interval() >= Duration::from_secs(7));
    }

    #[test]
    fn min_bound_respects_the_five_second_floor_for_small_bases() {
        let cfg = SchedulerConfig {
            base_interval: Duration::from_secs(8),
        };
        assert_eq!(cfg.min_interval(), Duration::from_secs(5));
    }
}
