//! # Circuit Breaker Behavior Trait
//!
//! Unifies all circuit breaker implementations in the system so consumers
//! that only need uniform access (health reporting, metrics collection) can
//! hold a `&dyn CircuitBreakerBehavior` instead of the concrete type.

use super::{CircuitBreakerMetrics, CircuitState};
use std::time::Duration;

/// Unified interface for a circuit breaker protecting one component.
///
/// - **Pre-flight check**: `should_allow()` — gate calls before attempting work.
/// - **Recording**: `record_success()` / `record_failure()` — update state after work.
/// - **Observability**: `state()`, `metrics()`, `is_healthy()`, `name()`.
/// - **Emergency**: `force_open()`, `force_closed()`.
pub trait CircuitBreakerBehavior: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn state(&self) -> CircuitState;

    /// Whether the circuit currently allows the next call through. `true`
    /// for Closed and HalfOpen; `true` for Open only once the recovery
    /// timeout has elapsed (transitioning the breaker to HalfOpen).
    fn should_allow(&self) -> bool;

    fn record_success(&self, duration: Duration);
    fn record_failure(&self, duration: Duration);
    fn is_healthy(&self) -> bool;
    fn force_open(&self);
    fn force_closed(&self);
    fn metrics(&self) -> CircuitBreakerMetrics;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time proof that CircuitBreakerBehavior is object-safe.
    fn _assert_object_safe(_: &dyn CircuitBreakerBehavior) {}
}
