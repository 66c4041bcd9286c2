//! # Wire Formats
//!
//! The two JSON payload shapes that cross a queue boundary (spec.md §6):
//! the command envelope enqueued to a domain's commands queue, and the
//! reply a worker or operator sends to a command's `reply_to` queue.
//! Both are opaque-`data`-carrying (spec.md §9): this crate does not know
//! or care what a handler's `data`/`result` JSON means.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The immutable envelope enqueued to `<domain>__commands`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub domain: String,
    pub command_type: String,
    pub command_id: Uuid,
    pub correlation_id: Uuid,
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CommandEnvelope {
    pub fn new(
        domain: impl Into<String>,
        command_type: impl Into<String>,
        command_id: Uuid,
        correlation_id: Uuid,
        data: serde_json::Value,
        reply_to: Option<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            command_type: command_type.into(),
            command_id,
            correlation_id,
            data,
            reply_to,
            created_at: Utc::now(),
        }
    }
}

/// Outcome of processing a command, carried on its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyOutcome {
    Success,
    Failed,
    Canceled,
}

/// The message sent to a command's `reply_to` queue (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub command_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    pub outcome: ReplyOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ReplyEnvelope {
    pub fn success(command_id: Uuid, correlation_id: Option<Uuid>, result: Option<serde_json::Value>) -> Self {
        Self {
            command_id,
            correlation_id,
            outcome: ReplyOutcome::Success,
            result,
            error_code: None,
            error_message: None,
        }
    }

    pub fn failed(
        command_id: Uuid,
        correlation_id: Option<Uuid>,
        error_code: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            command_id,
            correlation_id,
            outcome: ReplyOutcome::Failed,
            result: None,
            error_code: Some(error_code.into()),
            error_message: Some(error_message.into()),
        }
    }

    pub fn canceled(
        command_id: Uuid,
        correlation_id: Option<Uuid>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            command_id,
            correlation_id,
            outcome: ReplyOutcome::Canceled,
            result: None,
            error_code: None,
            error_message: Some(reason.into()),
        }
    }
}

/// Sentinel `error_code` on a `FAILED` reply that originated from a worker
/// escalating a command to the troubleshooting queue (Permanent error, or
/// Transient error with attempts exhausted) rather than from a
/// `BusinessRuleException`. The reply wire format (spec.md §6) has no
/// dedicated field for this distinction, and the process router needs one
/// to implement spec.md §4.9.3's branch between "await operator" and
/// "auto-compensate" — see DESIGN.md's Open Question (b) follow-on.
pub const TSQ_REPLY_ERROR_CODE: &str = "IN_TROUBLESHOOTING_QUEUE";

/// Queue naming conventions (spec.md §6): `<domain>__commands`,
/// `<domain>__replies`, `<domain>__process_replies`, and the NOTIFY channel
/// derived from a queue name.
pub struct QueueNames;

impl QueueNames {
    pub fn commands(domain: &str) -> String {
        format!("{domain}__commands")
    }

    pub fn replies(domain: &str) -> String {
        format!("{domain}__replies")
    }

    pub fn process_replies(domain: &str) -> String {
        format!("{domain}__process_replies")
    }

    pub fn notify_channel(queue: &str) -> String {
        format!("pgmq_notify_{queue}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_naming_matches_spec() {
        assert_eq!(QueueNames::commands("payments"), "payments__commands");
        assert_eq!(QueueNames::replies("payments"), "payments__replies");
        assert_eq!(
            QueueNames::process_replies("payments"),
            "payments__process_replies"
        );
        assert_eq!(
            QueueNames::notify_channel("payments__commands"),
            "pgmq_notify_payments__commands"
        );
    }

    #[test]
    fn reply_envelope_roundtrips_through_json() {
        let reply = ReplyEnvelope::success(Uuid::nil(), Some(Uuid::nil()), None);
        let json = serde_json::to_string(&reply).unwrap();
        let parsed: ReplyEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.outcome, ReplyOutcome::Success);
        assert!(parsed.error_code.is_none());
    }

    #[test]
    fn failed_reply_carries_error_fields() {
        let reply = ReplyEnvelope::failed(Uuid::nil(), None, "NO_ACCT", "account missing");
        assert_eq!(reply.outcome, ReplyOutcome::Failed);
        assert_eq!(reply.error_code.as_deref(), Some("NO_ACCT"));
    }
}
