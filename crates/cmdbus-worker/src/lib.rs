//! # cmdbus-worker
//!
//! The Worker (C7): a long-running leaser/dispatcher over one domain's
//! command queue, with bounded concurrency, LISTEN/poll idle waiting,
//! graceful drain, and retry/backoff/TSQ escalation (spec.md §4.7). Two
//! scheduling shapes share the same state-machine contract
//! ([`worker::WorkerCore`]): [`worker::Worker`] (cooperative async) and
//! [`pooled::PooledWorker`] (fixed thread pool).

pub mod health;
pub mod pooled;
pub mod retry;
pub mod worker;

pub use health::{HealthState, HealthThresholds, HealthTracker};
pub use pooled::PooledWorker;
pub use retry::{RetryDecision, RetryPolicy};
pub use worker::{Worker, WorkerCore, WorkerMetrics, WorkerMetricsSnapshot};
