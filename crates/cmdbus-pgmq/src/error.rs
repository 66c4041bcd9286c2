//! Queue-level error type. Kept separate from `cmdbus_shared::CmdBusError`
//! so this crate has no upward dependency on the coordination engine;
//! callers map it to `CmdBusError::Queue` at the boundary.

use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("pgmq error: {0}")]
    Pgmq(#[from] pgmq::errors::PgmqError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("circuit breaker open for '{0}'")]
    CircuitBreakerOpen(String),

    #[error("queue '{0}' not found")]
    QueueNotFound(String),
}

impl QueueError {
    pub fn circuit_breaker_open(component: impl Into<String>) -> Self {
        Self::CircuitBreakerOpen(component.into())
    }
}
