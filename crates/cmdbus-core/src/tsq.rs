//! Troubleshooting Queue (C8): the logical view over commands with
//! `status = IN_TROUBLESHOOTING_QUEUE`, plus the three operator operations
//! (spec.md §4.8). Every operation is transactional and emits an audit
//! event; each rejects with `InvalidOperation` if the command is not
//! currently in TSQ.

use cmdbus_pgmq::QueueClient;
use cmdbus_shared::wire::{QueueNames, ReplyEnvelope};
use cmdbus_shared::{CmdBusError, CmdBusResult};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::bus::CommandBus;
use crate::models::{AuditEventType, CommandMetadata, CommandStatus};
use crate::repository::batch::BatchRepository;
use crate::repository::command::{CommandRepository, FinishCommandArgs};

pub struct TroubleshootingQueue<'a> {
    pool: PgPool,
    queue: QueueClient,
    commands: &'a CommandRepository,
    batches: &'a BatchRepository,
    audit: &'a AuditLogger,
}

impl<'a> TroubleshootingQueue<'a> {
    pub fn new(bus: &'a CommandBus) -> Self {
        Self {
            pool: bus.pool().clone(),
            queue: bus.queue().clone(),
            commands: bus.commands_repo(),
            batches: bus.batches_repo(),
            audit: bus.audit_logger(),
        }
    }

    /// spec.md §4.8: joins metadata to archive, ordered by `updated_at`
    /// descending.
    pub async fn list(
        &self,
        domain: &str,
        command_type: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> CmdBusResult<Vec<CommandMetadata>> {
        let rows: Vec<CommandMetadata> = sqlx::query_as(
            r#"
            select * from command
            where domain = $1
              and status = 'IN_TROUBLESHOOTING_QUEUE'
              and ($2::text is null or command_type = $2)
            order by updated_at desc
            limit $3 offset $4
            "#,
        )
        .bind(domain)
        .bind(command_type)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn require_in_tsq(&self, domain: &str, command_id: Uuid) -> CmdBusResult<CommandMetadata> {
        let row = self.commands.get(domain, command_id).await?;
        if row.status != CommandStatus::InTroubleshootingQueue {
            return Err(CmdBusError::invalid_operation(format!(
                "command {command_id} is not in IN_TROUBLESHOOTING_QUEUE (current status: {})",
                row.status
            )));
        }
        Ok(row)
    }

    /// spec.md §4.8: fetch the archived payload, re-send fresh, reset
    /// metadata to `PENDING`/`attempts=0`, audit `OPERATOR_RETRY`, adjust
    /// batch counters.
    pub async fn operator_retry(
        &self,
        domain: &str,
        command_id: Uuid,
        operator: &str,
    ) -> CmdBusResult<()> {
        let row = self.require_in_tsq(domain, command_id).await?;
        let queue_name = QueueNames::commands(domain);

        let archived = self
            .queue
            .get_from_archive::<Value>(&queue_name, command_id)
            .await
            .map_err(|e| CmdBusError::queue(e.to_string()))?
            .ok_or_else(|| CmdBusError::invalid_operation(format!("no archived payload for {command_id}")))?;

        let new_msg_id = self
            .queue
            .send(&queue_name, &archived.payload, 0)
            .await
            .map_err(|e| CmdBusError::queue(e.to_string()))?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            update command
            set status = 'PENDING', attempts = 0, msg_id = $3,
                last_error_type = null, last_error_code = null, last_error_message = null,
                updated_at = now()
            where domain = $1 and command_id = $2
            "#,
        )
        .bind(domain)
        .bind(command_id)
        .bind(new_msg_id)
        .execute(&mut *tx)
        .await?;

        self.audit
            .record_tx(
                &mut tx,
                command_id,
                AuditEventType::OperatorRetry,
                Some(serde_json::json!({ "operator": operator })),
            )
            .await?;

        if let Some(batch_id) = row.batch_id {
            self.batches.sp_tsq_retry(&mut tx, domain, batch_id).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// spec.md §4.8: status -> `CANCELED`, reply `CANCELED` if `reply_to`
    /// set, audit `OPERATOR_CANCEL`, `sp_tsq_cancel`.
    pub async fn operator_cancel(
        &self,
        domain: &str,
        command_id: Uuid,
        reason: &str,
        operator: &str,
    ) -> CmdBusResult<bool> {
        let row = self.require_in_tsq(domain, command_id).await?;

        let mut tx = self.pool.begin().await?;
        let batch_complete = self
            .commands
            .sp_finish_command(
                &mut tx,
                domain,
                command_id,
                &FinishCommandArgs {
                    status: CommandStatus::Canceled,
                    event_type: AuditEventType::OperatorCancel,
                    err_type: None,
                    err_code: None,
                    err_message: None,
                    details: Some(serde_json::json!({ "operator": operator, "reason": reason })),
                    batch_id: None,
                },
            )
            .await?;

        let batch_complete = if let Some(batch_id) = row.batch_id {
            self.batches.sp_tsq_cancel(&mut tx, domain, batch_id).await?
        } else {
            batch_complete
        };

        tx.commit().await?;

        if let Some(reply_to) = &row.reply_to {
            let reply = ReplyEnvelope::canceled(command_id, Some(row.correlation_id), reason);
            if let Err(err) = self.queue.send(reply_to, &reply, 0).await {
                tracing::warn!(%command_id, error = %err, "failed to send operator-cancel reply");
            }
        }

        Ok(batch_complete)
    }

    /// spec.md §4.8: status -> `COMPLETED`, reply `SUCCESS` (+result),
    /// audit `OPERATOR_COMPLETE`, `sp_tsq_complete`.
    pub async fn operator_complete(
        &self,
        domain: &str,
        command_id: Uuid,
        result: Option<Value>,
        operator: &str,
    ) -> CmdBusResult<bool> {
        let row = self.require_in_tsq(domain, command_id).await?;

        let mut tx = self.pool.begin().await?;
        self.commands
            .sp_finish_command(
                &mut tx,
                domain,
                command_id,
                &FinishCommandArgs {
                    status: CommandStatus::Completed,
                    event_type: AuditEventType::OperatorComplete,
                    err_type: None,
                    err_code: None,
                    err_message: None,
                    details: Some(serde_json::json!({ "operator": operator })),
                    batch_id: None,
                },
            )
            .await?;

        let batch_complete = if let Some(batch_id) = row.batch_id {
            self.batches.sp_tsq_complete(&mut tx, domain, batch_id).await?
        } else {
            false
        };

        tx.commit().await?;

        if let Some(reply_to) = &row.reply_to {
            let reply = ReplyEnvelope::success(command_id, Some(row.correlation_id), result);
            if let Err(err) = self.queue.send(reply_to, &reply, 0).await {
                tracing::warn!(%command_id, error = %err, "failed to send operator-complete reply");
            }
        }

        Ok(batch_complete)
    }
}
