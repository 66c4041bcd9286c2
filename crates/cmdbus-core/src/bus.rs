//! Command Bus (C6): the public send/batch/query surface; composes C1-C5
//! (spec.md §4.6).

use std::collections::HashMap;
use std::sync::Arc;

use cmdbus_pgmq::QueueClient;
use cmdbus_shared::wire::{CommandEnvelope, QueueNames};
use cmdbus_shared::{CmdBusError, CmdBusResult};
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::models::{AuditEventType, Batch, CommandMetadata, CommandStatus};
use crate::repository::batch::{BatchRepository, NewBatch};
use crate::repository::command::{CommandRepository, NewCommand};

/// A single command in a `send_batch`/`create_batch` request.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub domain: String,
    pub command_type: String,
    pub command_id: Uuid,
    pub data: Value,
    pub correlation_id: Option<Uuid>,
    pub reply_to: Option<String>,
    pub max_attempts: Option<i32>,
}

/// In-memory, best-effort callback fired when a batch becomes complete
/// (spec.md §9: "document that callbacks are best-effort across
/// restarts"). Keyed by `batch_id`, lost on process restart.
pub type BatchCompleteCallback = Box<dyn Fn(Uuid) + Send + Sync>;

pub struct CommandBus {
    pool: PgPool,
    queue: QueueClient,
    commands: CommandRepository,
    batches: BatchRepository,
    audit: AuditLogger,
    default_max_attempts: i32,
    default_chunk_size: usize,
    batch_callbacks: Mutex<HashMap<Uuid, BatchCompleteCallback>>,
}

impl CommandBus {
    pub fn new(
        pool: PgPool,
        queue: QueueClient,
        default_max_attempts: i32,
        default_chunk_size: usize,
    ) -> Self {
        Self {
            commands: CommandRepository::new(pool.clone()),
            batches: BatchRepository::new(pool.clone()),
            audit: AuditLogger::new(pool.clone()),
            pool,
            queue,
            default_max_attempts,
            default_chunk_size,
            batch_callbacks: Mutex::new(HashMap::new()),
        }
    }

    /// spec.md §4.6: one transaction doing duplicate check, enqueue,
    /// metadata insert, and audit `SENT`. NOTIFY is part of this path.
    pub async fn send(
        &self,
        domain: &str,
        command_type: &str,
        command_id: Uuid,
        data: Value,
        correlation_id: Option<Uuid>,
        reply_to: Option<String>,
        max_attempts: Option<i32>,
        batch_id: Option<Uuid>,
    ) -> CmdBusResult<(Uuid, i64)> {
        let correlation_id = correlation_id.unwrap_or_else(Uuid::new_v4);
        let queue_name = QueueNames::commands(domain);

        let mut tx = self.pool.begin().await?;

        let envelope = CommandEnvelope::new(
            domain,
            command_type,
            command_id,
            correlation_id,
            data,
            reply_to.clone(),
        );
        let body = serde_json::to_value(&envelope)?;
        let msg_id = self
            .queue
            .send_batch(&mut tx, &queue_name, std::slice::from_ref(&body), 0)
            .await
            .map_err(|e| CmdBusError::queue(e.to_string()))?[0];

        self.commands
            .insert(
                &mut tx,
                &NewCommand {
                    domain: domain.to_string(),
                    command_id,
                    command_type: command_type.to_string(),
                    correlation_id,
                    reply_to,
                    max_attempts: max_attempts.unwrap_or(self.default_max_attempts),
                    batch_id,
                },
                msg_id,
            )
            .await?;

        self.audit
            .record_tx(&mut tx, command_id, AuditEventType::Sent, None)
            .await?;

        tx.commit().await?;

        self.queue
            .notify(&queue_name)
            .await
            .map_err(|e| CmdBusError::queue(e.to_string()))?;

        Ok((command_id, msg_id))
    }

    /// spec.md §4.6: groups by domain, chunks by `chunk_size`; one
    /// transaction per chunk; one NOTIFY per queue per chunk.
    pub async fn send_batch(
        &self,
        requests: Vec<CommandRequest>,
        chunk_size: Option<usize>,
    ) -> CmdBusResult<Vec<(Uuid, i64)>> {
        let chunk_size = chunk_size.unwrap_or(self.default_chunk_size).max(1);
        let mut by_domain: HashMap<String, Vec<CommandRequest>> = HashMap::new();
        for req in requests {
            by_domain.entry(req.domain.clone()).or_default().push(req);
        }

        let mut results = Vec::new();
        for (domain, reqs) in by_domain {
            let queue_name = QueueNames::commands(&domain);
            for chunk in reqs.chunks(chunk_size) {
                results.extend(self.send_chunk(&domain, &queue_name, chunk, None).await?);
            }
        }
        Ok(results)
    }

    async fn send_chunk(
        &self,
        domain: &str,
        queue_name: &str,
        chunk: &[CommandRequest],
        batch_id: Option<Uuid>,
    ) -> CmdBusResult<Vec<(Uuid, i64)>> {
        for req in chunk {
            if self.commands.get(domain, req.command_id).await.is_ok() {
                return Err(CmdBusError::duplicate_command(domain, req.command_id));
            }
        }

        let mut tx = self.pool.begin().await?;

        let envelopes: Vec<Value> = chunk
            .iter()
            .map(|req| {
                let correlation_id = req.correlation_id.unwrap_or_else(Uuid::new_v4);
                serde_json::to_value(CommandEnvelope::new(
                    domain,
                    &req.command_type,
                    req.command_id,
                    correlation_id,
                    req.data.clone(),
                    req.reply_to.clone(),
                ))
            })
            .collect::<Result<_, _>>()?;

        let msg_ids = self
            .queue
            .send_batch(&mut tx, queue_name, &envelopes, 0)
            .await
            .map_err(|e| CmdBusError::queue(e.to_string()))?;

        let mut results = Vec::with_capacity(chunk.len());
        for (req, msg_id) in chunk.iter().zip(msg_ids.iter().copied()) {
            let correlation_id = req.correlation_id.unwrap_or_else(Uuid::new_v4);
            self.commands
                .insert(
                    &mut tx,
                    &NewCommand {
                        domain: domain.to_string(),
                        command_id: req.command_id,
                        command_type: req.command_type.clone(),
                        correlation_id,
                        reply_to: req.reply_to.clone(),
                        max_attempts: req.max_attempts.unwrap_or(self.default_max_attempts),
                        batch_id,
                    },
                    msg_id,
                )
                .await?;
            results.push((req.command_id, msg_id));
        }

        let command_ids: Vec<Uuid> = chunk.iter().map(|req| req.command_id).collect();
        self.audit
            .record_batch_tx(&mut tx, &command_ids, AuditEventType::Sent)
            .await?;

        tx.commit().await?;

        self.queue
            .notify(queue_name)
            .await
            .map_err(|e| CmdBusError::queue(e.to_string()))?;

        Ok(results)
    }

    /// spec.md §4.6: insert batch row, send_batch, bulk metadata + audit,
    /// NOTIFY once, all in one transaction. Registers a best-effort
    /// `on_complete` callback keyed by `batch_id`.
    pub async fn create_batch(
        &self,
        domain: &str,
        commands: Vec<CommandRequest>,
        batch_id: Option<Uuid>,
        name: Option<String>,
        custom_data: Option<Value>,
        on_complete: Option<BatchCompleteCallback>,
    ) -> CmdBusResult<(Uuid, Vec<(Uuid, i64)>)> {
        let batch_id = batch_id.unwrap_or_else(Uuid::new_v4);
        let queue_name = QueueNames::commands(domain);

        let mut tx = self.pool.begin().await?;
        self.batches
            .insert(
                &mut tx,
                &NewBatch {
                    domain: domain.to_string(),
                    batch_id,
                    name,
                    custom_data,
                    total_count: commands.len() as i32,
                },
            )
            .await?;
        tx.commit().await?;

        if let Some(cb) = on_complete {
            self.batch_callbacks.lock().await.insert(batch_id, cb);
        }

        let mut results = Vec::with_capacity(commands.len());
        for chunk in commands.chunks(self.default_chunk_size) {
            results.extend(self.send_chunk(domain, &queue_name, chunk, Some(batch_id)).await?);
        }

        Ok((batch_id, results))
    }

    /// Invoked by the worker after a batch-completing transaction commits
    /// (spec.md §4.7.3). Best-effort, fire-and-forget per spec.md §9.
    pub async fn fire_batch_complete_callback(&self, batch_id: Uuid) {
        let cb = self.batch_callbacks.lock().await.remove(&batch_id);
        if let Some(cb) = cb {
            cb(batch_id);
        }
    }

    pub async fn get_command(&self, domain: &str, command_id: Uuid) -> CmdBusResult<CommandMetadata> {
        self.commands.get(domain, command_id).await
    }

    pub async fn list_batches(&self, domain: &str, limit: i64, offset: i64) -> CmdBusResult<Vec<Batch>> {
        self.batches.list(domain, limit, offset).await
    }

    pub async fn list_batch_commands(&self, domain: &str, batch_id: Uuid) -> CmdBusResult<Vec<CommandMetadata>> {
        self.commands
            .query_commands(Some(domain), None, None, None, None, i64::MAX, 0)
            .await
            .map(|rows| rows.into_iter().filter(|c| c.batch_id == Some(batch_id)).collect())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn query_commands(
        &self,
        domain: Option<&str>,
        command_type: Option<&str>,
        status: Option<CommandStatus>,
        created_after: Option<chrono::DateTime<chrono::Utc>>,
        created_before: Option<chrono::DateTime<chrono::Utc>>,
        limit: i64,
        offset: i64,
    ) -> CmdBusResult<Vec<CommandMetadata>> {
        self.commands
            .query_commands(domain, command_type, status, created_after, created_before, limit, offset)
            .await
    }

    pub async fn get_audit_trail(&self, command_id: Uuid) -> CmdBusResult<Vec<crate::models::AuditEvent>> {
        self.audit.trail(command_id).await
    }

    pub fn queue(&self) -> &QueueClient {
        &self.queue
    }

    pub fn commands_repo(&self) -> &CommandRepository {
        &self.commands
    }

    pub fn batches_repo(&self) -> &BatchRepository {
        &self.batches
    }

    pub fn audit_logger(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_requests_group_by_domain() {
        let requests = vec![
            CommandRequest {
                domain: "a".into(),
                command_type: "T".into(),
                command_id: Uuid::new_v4(),
                data: Value::Null,
                correlation_id: None,
                reply_to: None,
                max_attempts: None,
            },
            CommandRequest {
                domain: "b".into(),
                command_type: "T".into(),
                command_id: Uuid::new_v4(),
                data: Value::Null,
                correlation_id: None,
                reply_to: None,
                max_attempts: None,
            },
        ];
        let mut by_domain: HashMap<String, Vec<CommandRequest>> = HashMap::new();
        for req in requests {
            by_domain.entry(req.domain.clone()).or_default().push(req);
        }
        assert_eq!(by_domain.len(), 2);
    }
}
