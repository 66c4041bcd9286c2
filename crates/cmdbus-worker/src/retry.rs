//! Failure-handling decision table (spec.md §4.7.4). Maps a dispatch
//! outcome to a queue action and a terminal/non-terminal status, in the
//! fixed evaluation order the spec requires: the caught error's concrete
//! variant decides the row, never string matching on its code.

use std::time::Duration;

use cmdbus_core::{AuditEventType, CommandStatus, HandlerError};
use cmdbus_shared::config::BusConfig;

/// What the worker does next after a handler returns, derived from the
/// `HandlerError` variant and whether attempts are exhausted.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Defer via `set_visibility(delay)`; stays `IN_PROGRESS`.
    Defer { delay: Duration },
    /// Archive the message and move to `IN_TROUBLESHOOTING_QUEUE`.
    Escalate,
    /// Delete the message outright; terminal `FAILED`, no archive entry.
    Terminal,
}

pub struct RetryPolicy {
    bus: BusConfig,
}

impl RetryPolicy {
    pub fn new(bus: BusConfig) -> Self {
        Self { bus }
    }

    pub fn default_max_attempts(&self) -> i32 {
        self.bus.default_max_attempts as i32
    }

    /// spec.md §4.7.4's table, in evaluation order. `attempts` is the
    /// attempt count *after* `sp_receive_command` incremented it.
    pub fn decide(&self, error: &HandlerError, attempts: i32, max_attempts: i32) -> (RetryDecision, CommandStatus, AuditEventType) {
        match error {
            HandlerError::BusinessRule { .. } => (RetryDecision::Terminal, CommandStatus::Failed, AuditEventType::BusinessRuleFailed),
            HandlerError::Permanent { .. } => (RetryDecision::Escalate, CommandStatus::InTroubleshootingQueue, AuditEventType::MovedToTsq),
            HandlerError::Transient { .. } => {
                if attempts >= max_attempts {
                    (RetryDecision::Escalate, CommandStatus::InTroubleshootingQueue, AuditEventType::MovedToTsq)
                } else {
                    let delay = self.bus.backoff_for_attempt(attempts as u32);
                    (RetryDecision::Defer { delay }, CommandStatus::InProgress, AuditEventType::RetryScheduled)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(BusConfig::default())
    }

    #[test]
    fn transient_below_max_defers_with_backoff() {
        let (decision, status, event) = policy().decide(&HandlerError::transient("X", "x"), 1, 3);
        assert_eq!(decision, RetryDecision::Defer { delay: Duration::from_secs(10) });
        assert_eq!(status, CommandStatus::InProgress);
        assert_eq!(event, AuditEventType::RetryScheduled);
    }

    #[test]
    fn transient_at_max_escalates_to_tsq() {
        let (decision, status, _) = policy().decide(&HandlerError::transient("X", "x"), 3, 3);
        assert_eq!(decision, RetryDecision::Escalate);
        assert_eq!(status, CommandStatus::InTroubleshootingQueue);
    }

    #[test]
    fn permanent_always_escalates_regardless_of_attempts() {
        let (decision, status, _) = policy().decide(&HandlerError::permanent("BAD", "x"), 1, 3);
        assert_eq!(decision, RetryDecision::Escalate);
        assert_eq!(status, CommandStatus::InTroubleshootingQueue);
    }

    #[test]
    fn business_rule_is_terminal_failed_never_tsq() {
        let (decision, status, event) = policy().decide(&HandlerError::business_rule("NO_ACCT", "x"), 1, 3);
        assert_eq!(decision, RetryDecision::Terminal);
        assert_eq!(status, CommandStatus::Failed);
        assert_eq!(event, AuditEventType::BusinessRuleFailed);
    }

    #[test]
    fn backoff_clamps_at_schedule_tail() {
        let (decision, _, _) = policy().decide(&HandlerError::transient("X", "x"), 2, 5);
        assert_eq!(decision, RetryDecision::Defer { delay: Duration::from_secs(60) });
    }
}
