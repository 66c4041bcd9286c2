//! Worker (C7): the lease-dispatch-complete loop (spec.md §4.7). Both
//! scheduling shapes named in §4.7.1 share [`WorkerCore::process_one`] —
//! the state-machine contract is identical; only how messages are fanned
//! out to concurrent work differs.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cmdbus_core::{
    AuditEventType, Command, CommandBus, CommandStatus, HandlerContext, HandlerRegistry,
    VisibilityExtender,
};
use cmdbus_pgmq::{QueueClient, QueueListener, QueueMessage};
use cmdbus_shared::wire::{QueueNames, ReplyEnvelope};
use cmdbus_shared::config::WorkerConfig;
use cmdbus_shared::CmdBusResult;
use uuid::Uuid;

use crate::retry::{RetryDecision, RetryPolicy};

/// Processed/failed/in-flight counters surfaced for graceful shutdown and
/// the operator CLI's `system status` (SPEC_FULL.md's supplemented
/// generalization of spec.md §4.7.8's health component).
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub in_flight: AtomicI64,
}

impl WorkerMetrics {
    pub fn snapshot(&self) -> WorkerMetricsSnapshot {
        WorkerMetricsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed).max(0) as u64,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerMetricsSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub in_flight: u64,
}

struct QueueVisibilityExtender {
    queue: QueueClient,
    queue_name: String,
    msg_id: i64,
}

#[async_trait]
impl VisibilityExtender for QueueVisibilityExtender {
    async fn extend_visibility(&self, seconds: i64) -> CmdBusResult<()> {
        self.queue
            .set_visibility(&self.queue_name, self.msg_id, seconds)
            .await
            .map_err(|e| cmdbus_shared::CmdBusError::queue(e.to_string()))
    }
}

/// The shared per-message state machine (spec.md §4.7.3): Phase 1 receive
/// outside any transaction, Phase 2 process+complete inside one.
pub struct WorkerCore {
    pub domain: String,
    pub bus: Arc<CommandBus>,
    pub registry: Arc<HandlerRegistry>,
    pub retry_policy: RetryPolicy,
    pub metrics: Arc<WorkerMetrics>,
}

impl WorkerCore {
    /// Phase 1 + Phase 2 + failure handling for one queue message.
    /// Returns once the message's fate (retry/escalate/terminal/complete)
    /// is durably recorded; never panics on handler or infra error.
    pub async fn process_one(&self, queue_name: &str, msg: QueueMessage<Command>) {
        self.process_one_tracked(queue_name, msg).await;
    }

    /// Same as [`process_one`](Self::process_one) but reports whether the
    /// call completed without an infrastructure error, for callers (the
    /// pooled runtime's health tracker) that need the outcome.
    pub async fn process_one_tracked(&self, queue_name: &str, msg: QueueMessage<Command>) -> bool {
        self.metrics.in_flight.fetch_add(1, Ordering::Relaxed);
        let result = self.process_one_inner(queue_name, msg).await;
        self.metrics.in_flight.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(true) => {
                self.metrics.processed.fetch_add(1, Ordering::Relaxed);
                true
            }
            Ok(false) => true,
            Err(err) => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(domain = %self.domain, error = %err, "command processing failed with an infrastructure error");
                false
            }
        }
    }

    /// Returns `Ok(true)` if the command reached a terminal/TSQ state this
    /// call, `Ok(false)` if it was discarded at Phase 1 (not receivable).
    async fn process_one_inner(&self, queue_name: &str, msg: QueueMessage<Command>) -> CmdBusResult<bool> {
        let command = msg.payload;

        // Phase 1: receive (spec.md §4.7.3). No enclosing transaction —
        // the visibility timeout is the lock.
        let metadata = self
            .bus
            .commands_repo()
            .sp_receive_command(&self.domain, command.command_id, msg.msg_id)
            .await?;
        let Some(metadata) = metadata else {
            // Terminal or missing: discard without deleting. Ages out of
            // visibility; redelivery is only possible via operator retry.
            return Ok(false);
        };

        let extender = Arc::new(QueueVisibilityExtender {
            queue: self.bus.queue().clone(),
            queue_name: queue_name.to_string(),
            msg_id: msg.msg_id,
        });
        let ctx = HandlerContext::new(metadata.attempts, metadata.max_attempts, msg.msg_id, extender);

        let dispatch_result = self.registry.dispatch(&command, &ctx).await;

        match dispatch_result {
            Ok(result) => {
                let reply_result = result.clone();
                self.complete_success(queue_name, &command, msg.msg_id, metadata.batch_id, result)
                    .await?;
                self.emit_reply(
                    &command,
                    &metadata,
                    ReplyEnvelope::success(command.command_id, Some(command.correlation_id), Some(reply_result)),
                )
                .await;
                Ok(true)
            }
            Err(err) => {
                let (decision, status, event) =
                    self.retry_policy.decide(&err, metadata.attempts, metadata.max_attempts);
                self.apply_failure(queue_name, &command, msg.msg_id, metadata.batch_id, decision, status, event, &err)
                    .await?;

                if status.is_terminal() || status == CommandStatus::InTroubleshootingQueue {
                    // A business-rule failure reports the handler's own code
                    // so a process manager can recognize it; a TSQ escalation
                    // (permanent error, or transient exhausted) reports the
                    // reserved sentinel instead, since the handler's code
                    // there just means "needs an operator", not "compensate".
                    let outcome = if status == CommandStatus::InTroubleshootingQueue {
                        ReplyEnvelope::failed(
                            command.command_id,
                            Some(command.correlation_id),
                            cmdbus_shared::wire::TSQ_REPLY_ERROR_CODE,
                            err.message(),
                        )
                    } else {
                        ReplyEnvelope::failed(command.command_id, Some(command.correlation_id), err.code(), err.message())
                    };
                    self.emit_reply(&command, &metadata, outcome).await;
                }
                Ok(true)
            }
        }
    }

    /// Phase 2 success path (spec.md §4.7.3): handler result, queue
    /// delete, and `sp_finish_command` share one transaction.
    async fn complete_success(
        &self,
        queue_name: &str,
        command: &Command,
        msg_id: i64,
        batch_id: Option<Uuid>,
        result: serde_json::Value,
    ) -> CmdBusResult<()> {
        let mut tx = self.bus.pool().begin().await?;

        self.bus
            .queue()
            .delete_tx(&mut tx, queue_name, msg_id)
            .await
            .map_err(|e| cmdbus_shared::CmdBusError::queue(e.to_string()))?;

        let batch_complete = self
            .bus
            .commands_repo()
            .sp_finish_command(
                &mut tx,
                &self.domain,
                command.command_id,
                &cmdbus_core::repository::command::FinishCommandArgs {
                    status: CommandStatus::Completed,
                    event_type: AuditEventType::Completed,
                    err_type: None,
                    err_code: None,
                    err_message: None,
                    details: Some(result),
                    batch_id,
                },
            )
            .await?;

        tx.commit().await?;

        if batch_complete {
            if let Some(batch_id) = batch_id {
                self.bus.fire_batch_complete_callback(batch_id).await;
            }
        }
        Ok(())
    }

    /// Phase 2 failure path: records the decision from `RetryPolicy` and
    /// performs the matching queue action (spec.md §4.7.4's table).
    async fn apply_failure(
        &self,
        queue_name: &str,
        command: &Command,
        msg_id: i64,
        batch_id: Option<Uuid>,
        decision: RetryDecision,
        status: CommandStatus,
        event: AuditEventType,
        err: &cmdbus_core::HandlerError,
    ) -> CmdBusResult<()> {
        match decision {
            RetryDecision::Defer { delay } => {
                self.bus
                    .commands_repo()
                    .sp_fail_command(&self.domain, command.command_id, "transient", err.code(), err.message())
                    .await?;
                self.bus
                    .queue()
                    .set_visibility(queue_name, msg_id, delay.as_secs() as i64)
                    .await
                    .map_err(|e| cmdbus_shared::CmdBusError::queue(e.to_string()))?;
                Ok(())
            }
            RetryDecision::Escalate => {
                let mut tx = self.bus.pool().begin().await?;
                self.bus
                    .queue()
                    .archive_tx(&mut tx, queue_name, msg_id)
                    .await
                    .map_err(|e| cmdbus_shared::CmdBusError::queue(e.to_string()))?;
                let batch_complete = self
                    .bus
                    .commands_repo()
                    .sp_finish_command(
                        &mut tx,
                        &self.domain,
                        command.command_id,
                        &cmdbus_core::repository::command::FinishCommandArgs {
                            status,
                            event_type: event,
                            err_type: Some(handler_error_kind(err).to_string()),
                            err_code: Some(err.code().to_string()),
                            err_message: Some(err.message().to_string()),
                            details: err.details().cloned(),
                            batch_id,
                        },
                    )
                    .await?;
                tx.commit().await?;
                if batch_complete {
                    if let Some(batch_id) = batch_id {
                        self.bus.fire_batch_complete_callback(batch_id).await;
                    }
                }
                Ok(())
            }
            RetryDecision::Terminal => {
                let mut tx = self.bus.pool().begin().await?;
                self.bus
                    .queue()
                    .delete_tx(&mut tx, queue_name, msg_id)
                    .await
                    .map_err(|e| cmdbus_shared::CmdBusError::queue(e.to_string()))?;
                let batch_complete = self
                    .bus
                    .commands_repo()
                    .sp_finish_command(
                        &mut tx,
                        &self.domain,
                        command.command_id,
                        &cmdbus_core::repository::command::FinishCommandArgs {
                            status,
                            event_type: event,
                            err_type: Some(handler_error_kind(err).to_string()),
                            err_code: Some(err.code().to_string()),
                            err_message: Some(err.message().to_string()),
                            details: err.details().cloned(),
                            batch_id,
                        },
                    )
                    .await?;
                tx.commit().await?;
                if batch_complete {
                    if let Some(batch_id) = batch_id {
                        self.bus.fire_batch_complete_callback(batch_id).await;
                    }
                }
                Ok(())
            }
        }
    }

    /// spec.md §4.7.6: best-effort, post-commit, never reopens the
    /// finishing transaction.
    async fn emit_reply(&self, command: &Command, metadata: &cmdbus_core::CommandMetadata, reply: ReplyEnvelope) {
        let Some(reply_to) = &metadata.reply_to else {
            return;
        };
        if let Err(err) = self.bus.queue().send(reply_to, &reply, 0).await {
            tracing::warn!(command_id = %command.command_id, error = %err, "failed to emit reply");
        }
    }
}

fn handler_error_kind(err: &cmdbus_core::HandlerError) -> &'static str {
    match err {
        cmdbus_core::HandlerError::Transient { .. } => "transient",
        cmdbus_core::HandlerError::Permanent { .. } => "permanent",
        cmdbus_core::HandlerError::BusinessRule { .. } => "business_rule",
    }
}

/// Cooperative single-threaded worker (spec.md §4.7.1): one scheduler
/// thread, a bounded semaphore of capacity `N`, suspension at every I/O
/// call.
pub struct Worker {
    core: Arc<WorkerCore>,
    config: WorkerConfig,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(domain: impl Into<String>, bus: Arc<CommandBus>, registry: Arc<HandlerRegistry>, retry_policy: RetryPolicy, config: WorkerConfig) -> Self {
        Self {
            core: Arc::new(WorkerCore {
                domain: domain.into(),
                bus,
                registry,
                retry_policy,
                metrics: Arc::new(WorkerMetrics::default()),
            }),
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn metrics(&self) -> WorkerMetricsSnapshot {
        self.core.metrics.snapshot()
    }

    /// `stop(timeout)` (spec.md §4.7.7): sets the shutdown signal; callers
    /// still need to await `run`'s return, which honors the in-flight
    /// drain deadline.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// spec.md §4.7.2's main loop, expressed with a tokio semaphore and a
    /// `JoinSet` of in-flight handler tasks.
    pub async fn run(&self) -> CmdBusResult<()> {
        let queue_name = QueueNames::commands(&self.core.domain);
        self.core
            .bus
            .queue()
            .ensure_queue(&queue_name)
            .await
            .map_err(|e| cmdbus_shared::CmdBusError::queue(e.to_string()))?;

        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.config.concurrency));
        let mut tasks = tokio::task::JoinSet::new();
        let mut listener = if self.config.use_notify {
            Some(
                QueueListener::new(self.core.bus.pool().clone(), &queue_name)
                    .await
                    .map_err(|e| cmdbus_shared::CmdBusError::queue(e.to_string()))?,
            )
        } else {
            None
        };

        while !self.shutdown.load(Ordering::SeqCst) {
            self.drain_queue(&queue_name, &semaphore, &mut tasks).await?;
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.wait_for_messages(&mut listener).await;
            // reap finished tasks without blocking the poll cadence
            while tasks.try_join_next().is_some() {}
        }

        self.drain_in_flight(&mut tasks, self.config.shutdown_timeout()).await;
        Ok(())
    }

    async fn drain_queue(
        &self,
        queue_name: &str,
        semaphore: &Arc<tokio::sync::Semaphore>,
        tasks: &mut tokio::task::JoinSet<()>,
    ) -> CmdBusResult<()> {
        loop {
            while tasks.try_join_next().is_some() {}
            let available = semaphore.available_permits();
            if available == 0 {
                tasks.join_next().await;
                continue;
            }

            let messages = self
                .core
                .bus
                .queue()
                .read::<Command>(queue_name, self.config.visibility_timeout(), available as i32)
                .await
                .map_err(|e| cmdbus_shared::CmdBusError::queue(e.to_string()))?;

            if messages.is_empty() {
                return Ok(());
            }

            for msg in messages {
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
                let core = self.core.clone();
                let queue_name = queue_name.to_string();
                tasks.spawn(async move {
                    core.process_one(&queue_name, msg).await;
                    drop(permit);
                });
            }

            tokio::task::yield_now().await;
        }
    }

    /// spec.md §4.7.2: LISTEN with timeout, or sleep(P). NOTIFY shortens
    /// idle time; it never pops a message by itself.
    async fn wait_for_messages(&self, listener: &mut Option<QueueListener>) {
        match listener {
            Some(listener) => {
                listener.wait(self.config.poll_interval()).await;
            }
            None => {
                tokio::time::sleep(self.config.poll_interval()).await;
            }
        }
    }

    async fn drain_in_flight(&self, tasks: &mut tokio::task::JoinSet<()>, timeout: Duration) {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            if tasks.is_empty() {
                return;
            }
            tokio::select! {
                _ = tasks.join_next() => {}
                _ = &mut deadline => {
                    tracing::warn!(domain = %self.core.domain, remaining = tasks.len(), "shutdown timeout reached with handlers still in flight");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_snapshot_reflects_counters() {
        let metrics = WorkerMetrics::default();
        metrics.processed.fetch_add(2, Ordering::Relaxed);
        metrics.failed.fetch_add(1, Ordering::Relaxed);
        metrics.in_flight.fetch_add(3, Ordering::Relaxed);
        let snap = metrics.snapshot();
        assert_eq!(snap.processed, 2);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.in_flight, 3);
    }
}
