//! # Resilience
//!
//! Circuit breaker protection for the messaging path: a
//! `CircuitBreakerBehavior` trait unifying any number of breaker instances,
//! a concrete `CircuitBreaker` with atomic counters, and a
//! `CircuitBreakerMetrics` snapshot type for observability.

mod behavior;
mod circuit_breaker;
mod metrics;

pub use behavior::CircuitBreakerBehavior;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use metrics::{CircuitBreakerMetrics, MetricsCollector};
