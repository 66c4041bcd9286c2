//! Process Manager (C9): multi-step saga orchestration on top of the
//! command bus (spec.md §4.9). A concrete manager owns one `process_type`'s
//! step sequencing and compensation mapping; [`ProcessManagerRuntime`] owns
//! the mechanics shared by every process type (persistence, command
//! dispatch, reply routing, compensation walking).

use std::collections::HashMap;
use std::sync::Arc;

use cmdbus_core::CommandBus;
use cmdbus_shared::wire::{QueueNames, ReplyEnvelope, ReplyOutcome, TSQ_REPLY_ERROR_CODE};
use cmdbus_shared::{CmdBusError, CmdBusResult};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{Process, ProcessStatus};
use crate::repository::ProcessRepository;

/// One saga's step sequencing and compensation mapping.
///
/// State is opaque `serde_json::Value` and steps are plain `String`s rather
/// than the generic `TState`/`TStep` a single-implementation reading of
/// spec.md §4.9 might suggest: the core only ever stores and forwards this
/// state (spec.md §9's "process state ownership"), and a trait generic over
/// `TState`/`TStep` cannot be made into a trait object, which a
/// `HashMap<(domain, process_type), Arc<dyn ProcessManager>>` registry
/// needs. See DESIGN.md.
pub trait ProcessManager: Send + Sync {
    fn process_type(&self) -> &str;

    fn domain(&self) -> &str;

    /// Builds the process's initial `state` from the caller-supplied
    /// `initial_data` (spec.md §4.9.1).
    fn create_initial_state(&self, initial_data: Value) -> CmdBusResult<Value>;

    /// The step name to run first, derived from the initial state.
    fn get_first_step(&self, state: &Value) -> CmdBusResult<String>;

    /// Builds the `(command_type, data)` to send for a step.
    fn build_command(&self, step: &str, state: &Value) -> CmdBusResult<(String, Value)>;

    /// Folds a successful step's reply into a new state.
    fn update_state(&self, state: &Value, step: &str, reply: &ReplyEnvelope) -> CmdBusResult<Value>;

    /// The next step to run after `step` succeeded, or `None` if the
    /// process is complete.
    fn get_next_step(&self, current_step: &str, reply: &ReplyEnvelope, state: &Value) -> CmdBusResult<Option<String>>;

    /// The compensating step for a previously-succeeded `step`, if this
    /// saga defines one (spec.md §4.9.4). Steps with no mapping are skipped
    /// during compensation.
    fn get_compensation_step(&self, step: &str) -> Option<String>;
}

/// Keyed lookup of every registered manager, by `(domain, process_type)`.
#[derive(Default)]
pub struct ProcessManagerRegistry {
    managers: HashMap<(String, String), Arc<dyn ProcessManager>>,
}

impl ProcessManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, manager: Arc<dyn ProcessManager>) -> CmdBusResult<()> {
        let key = (manager.domain().to_string(), manager.process_type().to_string());
        if self.managers.contains_key(&key) {
            return Err(CmdBusError::invalid_operation(format!(
                "process manager already registered for {}/{}",
                key.0, key.1
            )));
        }
        self.managers.insert(key, manager);
        Ok(())
    }

    pub fn get(&self, domain: &str, process_type: &str) -> CmdBusResult<Arc<dyn ProcessManager>> {
        self.managers
            .get(&(domain.to_string(), process_type.to_string()))
            .cloned()
            .ok_or_else(|| CmdBusError::invalid_operation(format!("no process manager registered for {domain}/{process_type}")))
    }
}

/// Orchestration mechanics shared by every process type (spec.md §4.9):
/// starting a saga, sending one step's command, and folding a reply back
/// in — including the compensation walk of spec.md §4.9.4.
pub struct ProcessManagerRuntime {
    bus: Arc<CommandBus>,
    repo: ProcessRepository,
    registry: Arc<ProcessManagerRegistry>,
}

impl ProcessManagerRuntime {
    pub fn new(bus: Arc<CommandBus>, repo: ProcessRepository, registry: Arc<ProcessManagerRegistry>) -> Self {
        Self { bus, repo, registry }
    }

    pub fn repo(&self) -> &ProcessRepository {
        &self.repo
    }

    /// spec.md §4.9.1: creates the process row at its first step, then
    /// dispatches that step's command.
    pub async fn start(
        &self,
        domain: &str,
        process_type: &str,
        process_id: Option<Uuid>,
        initial_data: Value,
    ) -> CmdBusResult<Uuid> {
        let manager = self.registry.get(domain, process_type)?;
        let process_id = process_id.unwrap_or_else(Uuid::new_v4);
        let state = manager.create_initial_state(initial_data)?;
        let first_step = manager.get_first_step(&state)?;

        let mut tx = self.repo.pool().begin().await?;
        let process = self
            .repo
            .insert(&mut tx, domain, process_id, process_type, &first_step, state)
            .await?;
        tx.commit().await?;

        self.execute_step(manager.as_ref(), &process).await?;
        Ok(process_id)
    }

    /// spec.md §4.9.2: builds and records the step's command, marks the
    /// process `WAITING_FOR_REPLY`, then sends it.
    async fn execute_step(&self, manager: &dyn ProcessManager, process: &Process) -> CmdBusResult<()> {
        let (command_type, data) = manager.build_command(&process.current_step, &process.state)?;
        let command_id = Uuid::new_v4();

        let mut tx = self.repo.pool().begin().await?;
        self.repo
            .insert_audit_entry_tx(&mut tx, process.process_id, &process.current_step, command_id, &command_type, &data)
            .await?;
        self.repo
            .update_tx(
                &mut tx,
                &process.domain,
                process.process_id,
                ProcessStatus::WaitingForReply,
                &process.current_step,
                &process.state,
                process.compensating,
                &process.pending_compensations,
                process.compensation_target,
                None,
                None,
            )
            .await?;
        tx.commit().await?;

        self.bus
            .send(
                &process.domain,
                &command_type,
                command_id,
                data,
                Some(process.process_id),
                Some(QueueNames::process_replies(&process.domain)),
                None,
                None,
            )
            .await?;
        Ok(())
    }

    /// spec.md §4.9.3: stamps the reply onto its audit row, then advances
    /// the process according to the reply's outcome and the process's
    /// current compensation state. The queue message is deleted in the same
    /// transaction as whatever the reply does to the process row (spec.md
    /// §4.10), including the discard paths (no `correlation_id`, unknown
    /// process, or an already-terminal process).
    pub async fn handle_reply(
        &self,
        domain: &str,
        reply: &ReplyEnvelope,
        queue: &cmdbus_pgmq::QueueClient,
        queue_name: &str,
        msg_id: i64,
    ) -> CmdBusResult<()> {
        let Some(process_id) = reply.correlation_id else {
            let mut tx = self.repo.pool().begin().await?;
            queue
                .delete_tx(&mut tx, queue_name, msg_id)
                .await
                .map_err(|e| CmdBusError::queue(e.to_string()))?;
            tx.commit().await?;
            return Ok(());
        };

        let mut tx = self.repo.pool().begin().await?;
        let process = match self.repo.get_tx(&mut tx, domain, process_id).await {
            Ok(process) => process,
            Err(CmdBusError::ProcessNotFound { .. }) => {
                queue
                    .delete_tx(&mut tx, queue_name, msg_id)
                    .await
                    .map_err(|e| CmdBusError::queue(e.to_string()))?;
                tx.commit().await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if process.status.is_terminal() {
            queue
                .delete_tx(&mut tx, queue_name, msg_id)
                .await
                .map_err(|e| CmdBusError::queue(e.to_string()))?;
            tx.commit().await?;
            return Ok(());
        }

        let outcome_str = match reply.outcome {
            ReplyOutcome::Success => "SUCCESS",
            ReplyOutcome::Failed => "FAILED",
            ReplyOutcome::Canceled => "CANCELED",
        };
        self.repo.stamp_reply_tx(&mut tx, reply.command_id, outcome_str, reply.result.as_ref()).await?;

        let manager = self.registry.get(domain, &process.process_type)?;

        if process.compensating {
            self.advance_compensation(&mut tx, manager.as_ref(), &process, reply).await?;
            queue
                .delete_tx(&mut tx, queue_name, msg_id)
                .await
                .map_err(|e| CmdBusError::queue(e.to_string()))?;
            tx.commit().await?;
            return self.continue_if_waiting(domain, process_id).await;
        }

        match reply.outcome {
            ReplyOutcome::Canceled => {
                self.begin_compensation(&mut tx, manager.as_ref(), &process, ProcessStatus::Canceled, None, reply.error_message.as_deref())
                    .await?;
            }
            ReplyOutcome::Failed if reply.error_code.as_deref() == Some(TSQ_REPLY_ERROR_CODE) => {
                self.repo
                    .update_tx(
                        &mut tx,
                        domain,
                        process_id,
                        ProcessStatus::WaitingForTsq,
                        &process.current_step,
                        &process.state,
                        false,
                        &Value::Array(vec![]),
                        None,
                        reply.error_code.as_deref(),
                        reply.error_message.as_deref(),
                    )
                    .await?;
            }
            ReplyOutcome::Failed => {
                // A BusinessRuleException reply: auto-compensate what already
                // succeeded, landing the process at CANCELED (spec.md
                // §4.9.3).
                self.begin_compensation(
                    &mut tx,
                    manager.as_ref(),
                    &process,
                    ProcessStatus::Canceled,
                    reply.error_code.as_deref(),
                    reply.error_message.as_deref(),
                )
                .await?;
            }
            ReplyOutcome::Success => {
                let new_state = manager.update_state(&process.state, &process.current_step, reply)?;
                let next = manager.get_next_step(&process.current_step, reply, &new_state)?;
                match next {
                    Some(next_step) => {
                        self.repo
                            .update_tx(
                                &mut tx,
                                domain,
                                process_id,
                                ProcessStatus::InProgress,
                                &next_step,
                                &new_state,
                                false,
                                &Value::Array(vec![]),
                                None,
                                None,
                                None,
                            )
                            .await?;
                    }
                    None => {
                        self.repo
                            .update_tx(
                                &mut tx,
                                domain,
                                process_id,
                                ProcessStatus::Completed,
                                &process.current_step,
                                &new_state,
                                false,
                                &Value::Array(vec![]),
                                None,
                                None,
                                None,
                            )
                            .await?;
                    }
                }
            }
        }

        queue
            .delete_tx(&mut tx, queue_name, msg_id)
            .await
            .map_err(|e| CmdBusError::queue(e.to_string()))?;
        tx.commit().await?;
        self.continue_if_waiting(domain, process_id).await
    }

    /// After committing a reply-driven transition, re-reads the process and
    /// dispatches the next step's command if one is now pending. Runs
    /// outside the reply's transaction since `CommandBus::send` owns its
    /// own (spec.md §4.6).
    async fn continue_if_waiting(&self, domain: &str, process_id: Uuid) -> CmdBusResult<()> {
        let process = self.repo.get(domain, process_id).await?;
        match process.status {
            ProcessStatus::InProgress | ProcessStatus::Compensating => {
                let manager = self.registry.get(domain, &process.process_type)?;
                self.execute_step(manager.as_ref(), &process).await
            }
            _ => Ok(()),
        }
    }

    /// spec.md §4.9.4: walks previously-succeeded steps in reverse send
    /// order, compensating the ones that define a compensation step. Lands
    /// directly on `target` if nothing needs compensating.
    async fn begin_compensation(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        manager: &dyn ProcessManager,
        process: &Process,
        target: ProcessStatus,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> CmdBusResult<()> {
        let entries = self.repo.audit_entries_reverse_sent(process.process_id).await?;
        let steps: Vec<Value> = entries
            .iter()
            .filter(|e| e.has_success_reply())
            .filter(|e| manager.get_compensation_step(&e.step_name).is_some())
            .map(|e| Value::String(e.step_name.clone()))
            .collect();

        if steps.is_empty() {
            self.repo
                .update_tx(
                    tx,
                    &process.domain,
                    process.process_id,
                    target,
                    &process.current_step,
                    &process.state,
                    false,
                    &Value::Array(vec![]),
                    None,
                    error_code,
                    error_message,
                )
                .await?;
            return Ok(());
        }

        let mut remaining = steps;
        let first_original_step = remaining.remove(0);
        let first_original_step = first_original_step.as_str().expect("step names are strings").to_string();
        let comp_step = manager
            .get_compensation_step(&first_original_step)
            .expect("filtered to steps with a compensation mapping");

        self.repo
            .update_tx(
                tx,
                &process.domain,
                process.process_id,
                ProcessStatus::Compensating,
                &comp_step,
                &process.state,
                true,
                &Value::Array(remaining),
                Some(target),
                error_code,
                error_message,
            )
            .await
    }

    /// Advances an in-progress compensation by one reply (spec.md §4.9.4).
    /// A failure here is terminal: the `compensating` guard means this path
    /// never recurses into compensating the compensation itself.
    async fn advance_compensation(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        manager: &dyn ProcessManager,
        process: &Process,
        reply: &ReplyEnvelope,
    ) -> CmdBusResult<()> {
        if reply.outcome != ReplyOutcome::Success {
            self.repo
                .update_tx(
                    tx,
                    &process.domain,
                    process.process_id,
                    ProcessStatus::Failed,
                    &process.current_step,
                    &process.state,
                    true,
                    &Value::Array(vec![]),
                    process.compensation_target,
                    reply.error_code.as_deref(),
                    reply.error_message.as_deref(),
                )
                .await?;
            return Ok(());
        }

        let new_state = manager.update_state(&process.state, &process.current_step, reply)?;
        let mut remaining = process.pending_compensation_steps();

        match (!remaining.is_empty()).then(|| remaining.remove(0)) {
            Some(next_original_step) => {
                let comp_step = manager
                    .get_compensation_step(&next_original_step)
                    .expect("pending_compensations only ever holds steps with a compensation mapping");
                let remaining_json = Value::Array(remaining.into_iter().map(Value::String).collect());
                self.repo
                    .update_tx(
                        tx,
                        &process.domain,
                        process.process_id,
                        ProcessStatus::Compensating,
                        &comp_step,
                        &new_state,
                        true,
                        &remaining_json,
                        process.compensation_target,
                        None,
                        None,
                    )
                    .await
            }
            None => {
                let target = process.compensation_target.unwrap_or(ProcessStatus::Compensated);
                self.repo
                    .update_tx(
                        tx,
                        &process.domain,
                        process.process_id,
                        target,
                        &process.current_step,
                        &new_state,
                        true,
                        &Value::Array(vec![]),
                        None,
                        None,
                        None,
                    )
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopManager;

    impl ProcessManager for NoopManager {
        fn process_type(&self) -> &str {
            "noop"
        }
        fn domain(&self) -> &str {
            "test"
        }
        fn create_initial_state(&self, initial_data: Value) -> CmdBusResult<Value> {
            Ok(initial_data)
        }
        fn get_first_step(&self, _state: &Value) -> CmdBusResult<String> {
            Ok("A".into())
        }
        fn build_command(&self, step: &str, _state: &Value) -> CmdBusResult<(String, Value)> {
            Ok((step.to_string(), Value::Null))
        }
        fn update_state(&self, state: &Value, _step: &str, _reply: &ReplyEnvelope) -> CmdBusResult<Value> {
            Ok(state.clone())
        }
        fn get_next_step(&self, current_step: &str, _reply: &ReplyEnvelope, _state: &Value) -> CmdBusResult<Option<String>> {
            if current_step == "A" {
                Ok(Some("B".into()))
            } else {
                Ok(None)
            }
        }
        fn get_compensation_step(&self, step: &str) -> Option<String> {
            if step == "A" {
                Some("undo_A".into())
            } else {
                None
            }
        }
    }

    #[test]
    fn registry_rejects_duplicate_manager() {
        let mut registry = ProcessManagerRegistry::new();
        registry.register(Arc::new(NoopManager)).unwrap();
        let err = registry.register(Arc::new(NoopManager)).unwrap_err();
        assert!(matches!(err, CmdBusError::InvalidOperation(_)));
    }

    #[test]
    fn registry_get_missing_manager_is_invalid_operation() {
        let registry = ProcessManagerRegistry::new();
        let err = registry.get("test", "noop").unwrap_err();
        assert!(matches!(err, CmdBusError::InvalidOperation(_)));
    }

    #[test]
    fn compensation_step_lookup_skips_unmapped_steps() {
        let manager = NoopManager;
        assert_eq!(manager.get_compensation_step("A"), Some("undo_A".to_string()));
        assert_eq!(manager.get_compensation_step("B"), None);
    }
}
