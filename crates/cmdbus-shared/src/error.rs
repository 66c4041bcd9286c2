//! # Error Taxonomy
//!
//! Unified error type shared by the bus, worker, and process crates: one
//! `thiserror` enum, `#[from]` conversions for the infrastructure errors we
//! wrap, helper constructors for the domain errors, and an `is_recoverable`
//! classifier so callers (and the worker's retry logic) can make dispatch
//! decisions without string matching.

use thiserror::Error;
use uuid::Uuid;

/// Result alias used throughout the command bus crates.
pub type CmdBusResult<T> = Result<T, CmdBusError>;

/// Errors surfaced by the coordination engine (spec.md §6 error catalogue
/// plus infrastructure wrapping).
#[derive(Debug, Error)]
pub enum CmdBusError {
    #[error("duplicate command {command_id} in domain '{domain}'")]
    DuplicateCommand { domain: String, command_id: Uuid },

    #[error("command {command_id} not found in domain '{domain}'")]
    CommandNotFound { domain: String, command_id: Uuid },

    #[error("batch {batch_id} not found in domain '{domain}'")]
    BatchNotFound { domain: String, batch_id: Uuid },

    #[error("no handler registered for {domain}/{command_type}")]
    HandlerNotFound { domain: String, command_type: String },

    #[error("handler already registered for {domain}/{command_type}")]
    HandlerAlreadyRegistered { domain: String, command_type: String },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("process {process_id} not found in domain '{domain}'")]
    ProcessNotFound { domain: String, process_id: Uuid },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CmdBusError {
    pub fn duplicate_command(domain: impl Into<String>, command_id: Uuid) -> Self {
        Self::DuplicateCommand {
            domain: domain.into(),
            command_id,
        }
    }

    pub fn command_not_found(domain: impl Into<String>, command_id: Uuid) -> Self {
        Self::CommandNotFound {
            domain: domain.into(),
            command_id,
        }
    }

    pub fn batch_not_found(domain: impl Into<String>, batch_id: Uuid) -> Self {
        Self::BatchNotFound {
            domain: domain.into(),
            batch_id,
        }
    }

    pub fn handler_not_found(domain: impl Into<String>, command_type: impl Into<String>) -> Self {
        Self::HandlerNotFound {
            domain: domain.into(),
            command_type: command_type.into(),
        }
    }

    pub fn handler_already_registered(
        domain: impl Into<String>,
        command_type: impl Into<String>,
    ) -> Self {
        Self::HandlerAlreadyRegistered {
            domain: domain.into(),
            command_type: command_type.into(),
        }
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }

    pub fn process_not_found(domain: impl Into<String>, process_id: Uuid) -> Self {
        Self::ProcessNotFound {
            domain: domain.into(),
            process_id,
        }
    }

    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether retrying the caller-level operation (not the same thing as a
    /// handler's retry/backoff decision) is likely to succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Queue(_) | Self::Internal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_command_display() {
        let id = Uuid::nil();
        let err = CmdBusError::duplicate_command("payments", id);
        assert_eq!(
            err.to_string(),
            format!("duplicate command {id} in domain 'payments'")
        );
    }

    #[test]
    fn handler_not_found_is_not_recoverable() {
        let err = CmdBusError::handler_not_found("payments", "Charge");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn database_error_is_recoverable() {
        let err: CmdBusError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_recoverable());
    }

    #[test]
    fn invalid_operation_constructor() {
        let err = CmdBusError::invalid_operation("command is not in TSQ");
        match err {
            CmdBusError::InvalidOperation(msg) => assert_eq!(msg, "command is not in TSQ"),
            _ => panic!("expected InvalidOperation"),
        }
    }
}
