//! Health tracking for the thread-pooled runtime mode (spec.md §4.7.8):
//! pool timeouts, stuck threads, and consecutive failures roll up into a
//! `{HEALTHY, DEGRADED, CRITICAL}` state a watchdog can act on.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub degraded_consecutive_failures: u32,
    pub critical_consecutive_failures: u32,
    pub degraded_pool_timeouts: u32,
    pub critical_pool_timeouts: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_consecutive_failures: 3,
            critical_consecutive_failures: 10,
            degraded_pool_timeouts: 5,
            critical_pool_timeouts: 20,
        }
    }
}

/// A thread is "stuck" once it has shown no progress for longer than the
/// visibility timeout `V` (spec.md §4.7.8) — by then its lease has almost
/// certainly already expired and redelivered the message elsewhere.
pub struct HealthTracker {
    thresholds: HealthThresholds,
    visibility_timeout: Duration,
    pool_timeouts: AtomicU32,
    consecutive_failures: AtomicU32,
    last_progress_unix_ms: AtomicI64,
    started_at: Instant,
}

impl HealthTracker {
    pub fn new(thresholds: HealthThresholds, visibility_timeout: Duration) -> Self {
        Self {
            thresholds,
            visibility_timeout,
            pool_timeouts: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
            last_progress_unix_ms: AtomicI64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn record_pool_timeout(&self) {
        self.pool_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.mark_progress();
    }

    pub fn record_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        self.mark_progress();
    }

    fn mark_progress(&self) {
        let elapsed_ms = self.started_at.elapsed().as_millis() as i64;
        self.last_progress_unix_ms.store(elapsed_ms, Ordering::Relaxed);
    }

    pub fn is_stuck(&self) -> bool {
        let last = self.last_progress_unix_ms.load(Ordering::Relaxed);
        if last == 0 {
            return false;
        }
        let elapsed = self.started_at.elapsed().as_millis() as i64 - last;
        elapsed > self.visibility_timeout.as_millis() as i64
    }

    pub fn state(&self) -> HealthState {
        let failures = self.consecutive_failures.load(Ordering::Relaxed);
        let timeouts = self.pool_timeouts.load(Ordering::Relaxed);

        if failures >= self.thresholds.critical_consecutive_failures
            || timeouts >= self.thresholds.critical_pool_timeouts
            || self.is_stuck()
        {
            HealthState::Critical
        } else if failures >= self.thresholds.degraded_consecutive_failures
            || timeouts >= self.thresholds.degraded_pool_timeouts
        {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_healthy() {
        let tracker = HealthTracker::new(HealthThresholds::default(), Duration::from_secs(30));
        assert_eq!(tracker.state(), HealthState::Healthy);
    }

    #[test]
    fn degrades_after_threshold_failures() {
        let tracker = HealthTracker::new(HealthThresholds::default(), Duration::from_secs(30));
        for _ in 0..3 {
            tracker.record_failure();
        }
        assert_eq!(tracker.state(), HealthState::Degraded);
    }

    #[test]
    fn escalates_to_critical_after_many_failures() {
        let tracker = HealthTracker::new(HealthThresholds::default(), Duration::from_secs(30));
        for _ in 0..10 {
            tracker.record_failure();
        }
        assert_eq!(tracker.state(), HealthState::Critical);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let tracker = HealthTracker::new(HealthThresholds::default(), Duration::from_secs(30));
        for _ in 0..3 {
            tracker.record_failure();
        }
        tracker.record_success();
        assert_eq!(tracker.state(), HealthState::Healthy);
    }

    #[test]
    fn pool_timeouts_alone_can_trigger_degraded() {
        let tracker = HealthTracker::new(HealthThresholds::default(), Duration::from_secs(30));
        for _ in 0..5 {
            tracker.record_pool_timeout();
        }
        assert_eq!(tracker.state(), HealthState::Degraded);
    }
}
