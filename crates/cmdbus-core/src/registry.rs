//! Handler Registry (C5): maps `(domain, command_type) -> handler` and
//! dispatches with a per-invocation context (spec.md §4.5).
//!
//! A decorated-method dispatch pattern is re-expressed per spec.md §9 as a
//! plain map from a typed trait object; "instance scan" is just
//! registering every handler an object exposes through one call.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cmdbus_shared::{CmdBusError, CmdBusResult};
use serde_json::Value;

pub type Command = cmdbus_shared::wire::CommandEnvelope;

/// A handler-raised error, not an infrastructure failure. The worker
/// type-dispatches on this to decide retry/TSQ/FAILED routing (spec.md
/// §4.7.4) — never by matching on `code` strings.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("transient error {code}: {message}")]
    Transient {
        code: String,
        message: String,
        details: Option<Value>,
    },
    #[error("permanent error {code}: {message}")]
    Permanent {
        code: String,
        message: String,
        details: Option<Value>,
    },
    #[error("business rule violation {code}: {message}")]
    BusinessRule {
        code: String,
        message: String,
        details: Option<Value>,
    },
}

impl HandlerError {
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn business_rule(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BusinessRule {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Any handler panic or unclassified error is treated as transient with
    /// this synthetic code (spec.md §4.7.4's last taxonomy row).
    pub fn synthetic_transient(message: impl Into<String>) -> Self {
        Self::transient("INTERNAL_ERROR", message)
    }

    pub fn code(&self) -> &str {
        match self {
            Self::Transient { code, .. } | Self::Permanent { code, .. } | Self::BusinessRule { code, .. } => code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient { message, .. } | Self::Permanent { message, .. } | Self::BusinessRule { message, .. } => message,
        }
    }

    pub fn details(&self) -> Option<&Value> {
        match self {
            Self::Transient { details, .. } | Self::Permanent { details, .. } | Self::BusinessRule { details, .. } => {
                details.as_ref()
            }
        }
    }
}

/// Per-invocation utilities handed to a handler alongside the immutable
/// `Command` (spec.md §3, §4.5).
#[async_trait]
pub trait VisibilityExtender: Send + Sync {
    async fn extend_visibility(&self, seconds: i64) -> CmdBusResult<()>;
}

pub struct HandlerContext {
    pub attempt: i32,
    pub max_attempts: i32,
    pub msg_id: i64,
    extender: Arc<dyn VisibilityExtender>,
}

impl HandlerContext {
    pub fn new(attempt: i32, max_attempts: i32, msg_id: i64, extender: Arc<dyn VisibilityExtender>) -> Self {
        Self {
            attempt,
            max_attempts,
            msg_id,
            extender,
        }
    }

    /// A handler's only sanctioned mechanism to outlive the visibility
    /// timeout `V` (spec.md §4.7.5). The worker never auto-extends.
    pub async fn extend_visibility(&self, seconds: i64) -> CmdBusResult<()> {
        self.extender.extend_visibility(seconds).await
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: &Command, ctx: &HandlerContext) -> Result<Value, HandlerError>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, String), Arc<dyn CommandHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct registration. Duplicate `(domain, command_type)` is an error
    /// (spec.md §4.5).
    pub fn register(
        &mut self,
        domain: impl Into<String>,
        command_type: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
    ) -> CmdBusResult<()> {
        let key = (domain.into(), command_type.into());
        if self.handlers.contains_key(&key) {
            return Err(CmdBusError::handler_already_registered(key.0, key.1));
        }
        self.handlers.insert(key, handler);
        Ok(())
    }

    /// Instance scan: register every `(domain, command_type, handler)`
    /// triple a caller-constructed table provides in one call. Stands in
    /// for the decorated-method/reflection pass spec.md §9 calls out —
    /// there is no annotation metadata to scan for in a statically typed
    /// registry, so the caller supplies the table explicitly.
    pub fn register_many(
        &mut self,
        entries: impl IntoIterator<Item = (String, String, Arc<dyn CommandHandler>)>,
    ) -> CmdBusResult<()> {
        for (domain, command_type, handler) in entries {
            self.register(domain, command_type, handler)?;
        }
        Ok(())
    }

    pub fn is_registered(&self, domain: &str, command_type: &str) -> bool {
        self.handlers.contains_key(&(domain.to_string(), command_type.to_string()))
    }

    /// A missing handler for a received command is a configuration fault,
    /// not a message fault (spec.md §7): the worker maps this to a
    /// `PermanentCommandError` with code `HANDLER_NOT_FOUND`, not a panic.
    pub async fn dispatch(
        &self,
        command: &Command,
        ctx: &HandlerContext,
    ) -> Result<Value, HandlerError> {
        let key = (command.domain.clone(), command.command_type.clone());
        match self.handlers.get(&key) {
            Some(handler) => handler.handle(command, ctx).await,
            None => Err(HandlerError::permanent(
                "HANDLER_NOT_FOUND",
                format!("no handler registered for {}/{}", key.0, key.1),
            )),
        }
    }
}
