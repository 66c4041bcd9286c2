//! Row shapes for the `command`, `batch`, and `audit` tables (spec.md §3).
//! These are plain data structs: the state machine lives in the stored
//! procedures (`repository::command`, `repository::batch`), not here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// `CommandMetadata.status` domain (spec.md §3).
///
/// `Failed` is reached only via a business-rule exception, never from
/// retry exhaustion; `InTroubleshootingQueue` is quasi-terminal and only
/// leaves via operator action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Pending,
    InProgress,
    Completed,
    Canceled,
    InTroubleshootingQueue,
    Failed,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Canceled | Self::Failed)
    }

    pub fn is_receivable(self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Canceled => "CANCELED",
            Self::InTroubleshootingQueue => "IN_TROUBLESHOOTING_QUEUE",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// The mutable row keyed by `(domain, command_id)` (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CommandMetadata {
    pub domain: String,
    pub command_id: Uuid,
    pub command_type: String,
    pub status: CommandStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub msg_id: Option<i64>,
    pub correlation_id: Uuid,
    pub reply_to: Option<String>,
    pub last_error_type: Option<String>,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub batch_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `Batch.status` domain (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    InProgress,
    Completed,
    CompletedWithFailures,
}

/// The row keyed by `(domain, batch_id)`, closed at creation (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Batch {
    pub domain: String,
    pub batch_id: Uuid,
    pub name: Option<String>,
    pub custom_data: Option<serde_json::Value>,
    pub status: BatchStatus,
    pub total_count: i32,
    pub completed_count: i32,
    pub canceled_count: i32,
    pub in_troubleshooting_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Batch {
    /// `completed + canceled = total` — no commands in flight or in TSQ.
    pub fn is_complete(&self) -> bool {
        self.completed_count + self.canceled_count == self.total_count
    }

    pub fn derive_status(&self) -> BatchStatus {
        if !self.is_complete() {
            if self.completed_count == 0 && self.canceled_count == 0 && self.in_troubleshooting_count == 0 {
                BatchStatus::Pending
            } else {
                BatchStatus::InProgress
            }
        } else if self.canceled_count == 0 {
            BatchStatus::Completed
        } else {
            BatchStatus::CompletedWithFailures
        }
    }
}

/// Append-only per-command record (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    Sent,
    Received,
    Completed,
    Failed,
    BusinessRuleFailed,
    RetryScheduled,
    MovedToTsq,
    OperatorRetry,
    OperatorCancel,
    OperatorComplete,
    BatchStarted,
    BatchCompleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditEvent {
    pub id: i64,
    pub command_id: Uuid,
    pub event_type: AuditEventType,
    pub ts: DateTime<Utc>,
    pub details: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(total: i32, completed: i32, canceled: i32, tsq: i32) -> Batch {
        Batch {
            domain: "test".into(),
            batch_id: Uuid::nil(),
            name: None,
            custom_data: None,
            status: BatchStatus::Pending,
            total_count: total,
            completed_count: completed,
            canceled_count: canceled,
            in_troubleshooting_count: tsq,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn incomplete_batch_with_pending_work_is_in_progress() {
        let b = batch(3, 1, 0, 0);
        assert!(!b.is_complete());
        assert_eq!(b.derive_status(), BatchStatus::InProgress);
    }

    #[test]
    fn complete_batch_with_no_cancellations_is_completed() {
        let b = batch(3, 3, 0, 0);
        assert!(b.is_complete());
        assert_eq!(b.derive_status(), BatchStatus::Completed);
    }

    #[test]
    fn complete_batch_with_cancellations_is_completed_with_failures() {
        let b = batch(3, 2, 1, 0);
        assert!(b.is_complete());
        assert_eq!(b.derive_status(), BatchStatus::CompletedWithFailures);
    }

    #[test]
    fn batch_with_in_tsq_commands_is_not_complete() {
        let b = batch(3, 2, 0, 1);
        assert!(!b.is_complete());
    }

    #[test]
    fn fresh_batch_with_no_activity_is_pending() {
        let b = batch(3, 0, 0, 0);
        assert_eq!(b.derive_status(), BatchStatus::Pending);
    }

    #[test]
    fn command_status_terminal_classification() {
        assert!(CommandStatus::Completed.is_terminal());
        assert!(CommandStatus::Canceled.is_terminal());
        assert!(CommandStatus::Failed.is_terminal());
        assert!(!CommandStatus::InTroubleshootingQueue.is_terminal());
        assert!(!CommandStatus::Pending.is_terminal());
    }

    #[test]
    fn command_status_receivable_classification() {
        assert!(CommandStatus::Pending.is_receivable());
        assert!(CommandStatus::InProgress.is_receivable());
        assert!(!CommandStatus::InTroubleshootingQueue.is_receivable());
        assert!(!CommandStatus::Completed.is_receivable());
    }
}
