//! # Circuit Breaker
//!
//! A classic closed/open/half-open breaker with atomic counters, used to
//! optionally protect the queue client's send/receive path (see
//! `cmdbus-pgmq::client::QueueClient::with_circuit_breaker`).

use super::behavior::CircuitBreakerBehavior;
use super::metrics::CircuitBreakerMetrics;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl From<CircuitState> for u8 {
    fn from(value: CircuitState) -> Self {
        match value {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

/// Configuration for a single circuit breaker instance.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker trips open.
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a half-open probe.
    pub timeout: Duration,
    /// Consecutive successes in half-open before the breaker closes again.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// A circuit breaker protecting one named component.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    half_open_successes: AtomicU32,
    total_calls: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    total_duration_micros: AtomicU64,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(name: String, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            state: AtomicU8::new(CircuitState::Closed.into()),
            consecutive_failures: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            total_calls: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            total_duration_micros: AtomicU64::new(0),
            opened_at: Mutex::new(None),
        }
    }

    fn load_state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    fn transition_to(&self, new_state: CircuitState) {
        let old = self.load_state();
        if old == new_state {
            return;
        }
        self.state.store(new_state.into(), Ordering::Release);
        match new_state {
            CircuitState::Open => {
                *self.opened_at.lock().expect("circuit breaker mutex poisoned") = Some(Instant::now());
                self.half_open_successes.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                self.half_open_successes.store(0, Ordering::Release);
            }
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::Release);
                *self.opened_at.lock().expect("circuit breaker mutex poisoned") = None;
            }
        }
        tracing::info!(
            circuit_breaker = %self.name,
            from_state = ?old,
            to_state = ?new_state,
            "circuit breaker state transition"
        );
    }

    /// Manual recording entry point used by callers that already timed the
    /// operation themselves (e.g. `with_breaker` in the messaging client).
    pub fn record_success_manual(&self, duration: Duration) {
        self.record_success(duration);
    }

    pub fn record_failure_manual(&self, duration: Duration) {
        self.record_failure(duration);
    }
}

impl CircuitBreakerBehavior for CircuitBreaker {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> CircuitState {
        self.load_state()
    }

    fn should_allow(&self) -> bool {
        match self.load_state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .lock()
                    .expect("circuit breaker mutex poisoned")
                    .map(|at| at.elapsed());
                match elapsed {
                    Some(elapsed) if elapsed >= self.config.timeout => {
                        self.transition_to(CircuitState::HalfOpen);
                        true
                    }
                    _ => false,
                }
            }
        }
    }

    fn record_success(&self, duration: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.total_duration_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Release);

        if self.load_state() == CircuitState::HalfOpen {
            let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
            if successes >= self.config.success_threshold {
                self.transition_to(CircuitState::Closed);
            }
        }
    }

    fn record_failure(&self, duration: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.total_duration_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);

        match self.load_state() {
            CircuitState::HalfOpen => {
                // A single failure during the probe re-opens the breaker.
                self.transition_to(CircuitState::Open);
            }
            CircuitState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.transition_to(CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn is_healthy(&self) -> bool {
        self.metrics().is_healthy()
    }

    fn force_open(&self) {
        self.transition_to(CircuitState::Open);
    }

    fn force_closed(&self) {
        self.transition_to(CircuitState::Closed);
    }

    fn metrics(&self) -> CircuitBreakerMetrics {
        let total_calls = self.total_calls.load(Ordering::Relaxed);
        let success_count = self.success_count.load(Ordering::Relaxed);
        let failure_count = self.failure_count.load(Ordering::Relaxed);
        let total_duration = Duration::from_micros(self.total_duration_micros.load(Ordering::Relaxed));

        let failure_rate = if total_calls == 0 {
            0.0
        } else {
            failure_count as f64 / total_calls as f64
        };
        let success_rate = if total_calls == 0 {
            0.0
        } else {
            success_count as f64 / total_calls as f64
        };
        let average_duration = if total_calls == 0 {
            Duration::ZERO
        } else {
            total_duration / total_calls as u32
        };

        CircuitBreakerMetrics {
            total_calls,
            success_count,
            failure_count,
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed) as u64,
            half_open_calls: self.half_open_successes.load(Ordering::Relaxed) as u64,
            total_duration,
            current_state: self.load_state(),
            failure_rate,
            success_rate,
            average_duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, success_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test".to_string(),
            CircuitBreakerConfig {
                failure_threshold,
                timeout: Duration::from_millis(20),
                success_threshold,
            },
        )
    }

    #[test]
    fn starts_closed_and_allows_calls() {
        let cb = breaker(3, 1);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.should_allow());
    }

    #[test]
    fn trips_open_after_threshold_failures() {
        let cb = breaker(3, 1);
        for _ in 0..3 {
            cb.record_failure(Duration::from_millis(1));
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.should_allow());
    }

    #[test]
    fn half_opens_after_timeout_and_closes_on_success() {
        let cb = breaker(1, 1);
        cb.record_failure(Duration::from_millis(1));
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(25));
        assert!(cb.should_allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success(Duration::from_millis(1));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = breaker(1, 2);
        cb.record_failure(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(25));
        assert!(cb.should_allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure(Duration::from_millis(1));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn force_open_and_force_closed() {
        let cb = breaker(5, 2);
        cb.force_open();
        assert_eq!(cb.state(), CircuitState::Open);
        cb.force_closed();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn metrics_track_totals() {
        let cb = breaker(5, 2);
        cb.record_success(Duration::from_millis(10));
        cb.record_failure(Duration::from_millis(20));
        let metrics = cb.metrics();
        assert_eq!(metrics.total_calls, 2);
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.failure_count, 1);
        assert!((metrics.failure_rate - 0.5).abs() < f64::EPSILON);
    }
}
