//! # Circuit Breaker Metrics
//!
//! A point-in-time snapshot of one circuit breaker's counters, suitable for
//! logging, health endpoints, or a `MetricsCollector` export.

use super::circuit_breaker::CircuitState;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u64,
    pub half_open_calls: u64,
    pub total_duration: Duration,
    pub current_state: CircuitState,
    pub failure_rate: f64,
    pub success_rate: f64,
    pub average_duration: Duration,
}

impl CircuitBreakerMetrics {
    pub fn new() -> Self {
        Self {
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            half_open_calls: 0,
            total_duration: Duration::ZERO,
            current_state: CircuitState::Closed,
            failure_rate: 0.0,
            success_rate: 0.0,
            average_duration: Duration::ZERO,
        }
    }

    pub fn is_healthy(&self) -> bool {
        match self.current_state {
            CircuitState::Closed => self.failure_rate < 0.1,
            CircuitState::Open => false,
            CircuitState::HalfOpen => true,
        }
    }

    pub fn state_description(&self) -> &'static str {
        match self.current_state {
            CircuitState::Closed => "Healthy - Normal operation",
            CircuitState::Open => "Failing - Rejecting all calls",
            CircuitState::HalfOpen => "Recovering - Testing system health",
        }
    }

    pub fn format_summary(&self) -> String {
        format!(
            "State: {} | Calls: {} | Success: {:.1}% | Failures: {} | Avg Duration: {:.2}ms",
            self.state_description(),
            self.total_calls,
            self.success_rate * 100.0,
            self.failure_count,
            self.average_duration.as_millis()
        )
    }
}

impl Default for CircuitBreakerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Hook for exporting breaker metrics to an external monitoring system.
/// `cmdbus` does not ship a concrete exporter (metrics export is a spec.md
/// Non-goal); this trait exists so one can be plugged in without touching
/// the breaker itself.
pub trait MetricsCollector: Send + Sync {
    fn record_circuit_breaker_metrics(&self, name: &str, metrics: &CircuitBreakerMetrics);
    fn record_state_transition(&self, name: &str, from: CircuitState, to: CircuitState);
    fn record_operation_timing(&self, name: &str, duration: Duration, success: bool);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_metrics_are_healthy() {
        let metrics = CircuitBreakerMetrics::new();
        assert_eq!(metrics.total_calls, 0);
        assert!(metrics.is_healthy());
    }

    #[test]
    fn closed_state_health_depends_on_failure_rate() {
        let mut metrics = CircuitBreakerMetrics::new();
        metrics.failure_rate = 0.05;
        assert!(metrics.is_healthy());
        metrics.failure_rate = 0.2;
        assert!(!metrics.is_healthy());
    }

    #[test]
    fn open_state_is_never_healthy() {
        let mut metrics = CircuitBreakerMetrics::new();
        metrics.current_state = CircuitState::Open;
        assert!(!metrics.is_healthy());
    }
}
