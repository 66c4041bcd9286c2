//! Row shapes for the `process` and `process_audit` tables (spec.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// `Process.status` domain (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    Pending,
    InProgress,
    WaitingForReply,
    Completed,
    WaitingForTsq,
    Compensating,
    Compensated,
    Canceled,
    Failed,
}

impl ProcessStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Compensated | Self::Canceled | Self::Failed)
    }
}

/// The row keyed by `(domain, process_id)` (spec.md §3). `state` is opaque
/// JSON shaped by the concrete manager; the core never interprets it
/// (spec.md §9's "process state ownership").
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Process {
    pub domain: String,
    pub process_id: Uuid,
    pub process_type: String,
    pub status: ProcessStatus,
    pub current_step: String,
    pub state: Value,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// Guards against recursive compensation (Open Question (c) / DESIGN.md):
    /// once true, a further failure during compensation routes straight to
    /// `FAILED` rather than compensating the compensation.
    pub compensating: bool,
    /// Remaining compensation steps still to execute, most-recent-first.
    /// Empty once compensation drains to its target terminal status.
    pub pending_compensations: Value,
    /// The terminal status to apply once `pending_compensations` drains:
    /// `COMPENSATED` (TSQ-cancel path) or `CANCELED` (business-rule path).
    pub compensation_target: Option<ProcessStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Process {
    pub fn pending_compensation_steps(&self) -> Vec<String> {
        serde_json::from_value(self.pending_compensations.clone()).unwrap_or_default()
    }
}

/// Append-only per-step record (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProcessAuditEntry {
    pub id: i64,
    pub process_id: Uuid,
    pub step_name: String,
    pub command_id: Uuid,
    pub command_type: String,
    pub command_data: Value,
    pub sent_at: DateTime<Utc>,
    pub reply_outcome: Option<String>,
    pub reply_data: Option<Value>,
    pub received_at: Option<DateTime<Utc>>,
}

impl ProcessAuditEntry {
    pub fn has_success_reply(&self) -> bool {
        self.reply_outcome.as_deref() == Some("SUCCESS")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_status_terminal_classification() {
        assert!(ProcessStatus::Completed.is_terminal());
        assert!(ProcessStatus::Compensated.is_terminal());
        assert!(ProcessStatus::Canceled.is_terminal());
        assert!(ProcessStatus::Failed.is_terminal());
        assert!(!ProcessStatus::WaitingForReply.is_terminal());
        assert!(!ProcessStatus::Compensating.is_terminal());
    }

    #[test]
    fn pending_compensation_steps_defaults_empty_on_bad_json() {
        let process = Process {
            domain: "d".into(),
            process_id: Uuid::nil(),
            process_type: "t".into(),
            status: ProcessStatus::Pending,
            current_step: "A".into(),
            state: Value::Null,
            error_code: None,
            error_message: None,
            compensating: false,
            pending_compensations: Value::Null,
            compensation_target: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(process.pending_compensation_steps().is_empty());
    }

    #[test]
    fn audit_entry_recognizes_success_reply() {
        let entry = ProcessAuditEntry {
            id: 1,
            process_id: Uuid::nil(),
            step_name: "A".into(),
            command_id: Uuid::nil(),
            command_type: "T".into(),
            command_data: Value::Null,
            sent_at: Utc::now(),
            reply_outcome: Some("SUCCESS".into()),
            reply_data: None,
            received_at: Some(Utc::now()),
        };
        assert!(entry.has_success_reply());
    }
}
