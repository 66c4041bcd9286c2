//! Command Repository (C2): CRUD plus the two atomic stored-procedure
//! wrappers that are the transactional hinges of the system (spec.md §4.2).
//!
//! The "stored procedures" are expressed here as single round-trip SQL
//! statements executed against a caller-supplied transaction, rather than
//! as actual Postgres `CREATE FUNCTION` bodies — keeping the atomicity
//! contract (row lock, status guard, audit append, batch counter update)
//! in one place is what the spec requires, not where the SQL text lives.

use chrono::{DateTime, Utc};
use cmdbus_shared::{CmdBusError, CmdBusResult};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{AuditEventType, CommandMetadata, CommandStatus};

#[derive(Debug, Clone)]
pub struct NewCommand {
    pub domain: String,
    pub command_id: Uuid,
    pub command_type: String,
    pub correlation_id: Uuid,
    pub reply_to: Option<String>,
    pub max_attempts: i32,
    pub batch_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct FinishCommandArgs {
    pub status: CommandStatus,
    pub event_type: AuditEventType,
    pub err_type: Option<String>,
    pub err_code: Option<String>,
    pub err_message: Option<String>,
    pub details: Option<Value>,
    pub batch_id: Option<Uuid>,
}

pub struct CommandRepository {
    pool: PgPool,
}

impl CommandRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a brand-new `PENDING` metadata row inside the caller's
    /// transaction (the Command Bus's send path, spec.md §4.6). Duplicate
    /// `(domain, command_id)` surfaces as `DuplicateCommand`.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        cmd: &NewCommand,
        msg_id: i64,
    ) -> CmdBusResult<CommandMetadata> {
        let existing: Option<(Uuid,)> = sqlx::query_as(
            "select command_id from command where domain = $1 and command_id = $2",
        )
        .bind(&cmd.domain)
        .bind(cmd.command_id)
        .fetch_optional(&mut **tx)
        .await?;

        if existing.is_some() {
            return Err(CmdBusError::duplicate_command(&cmd.domain, cmd.command_id));
        }

        let row: CommandMetadata = sqlx::query_as(
            r#"
            insert into command
                (domain, command_id, command_type, status, attempts, max_attempts,
                 msg_id, correlation_id, reply_to, batch_id, created_at, updated_at)
            values
                ($1, $2, $3, 'PENDING', 0, $4, $5, $6, $7, $8, now(), now())
            returning *
            "#,
        )
        .bind(&cmd.domain)
        .bind(cmd.command_id)
        .bind(&cmd.command_type)
        .bind(cmd.max_attempts)
        .bind(msg_id)
        .bind(cmd.correlation_id)
        .bind(&cmd.reply_to)
        .bind(cmd.batch_id)
        .fetch_one(&mut **tx)
        .await?;

        Ok(row)
    }

    pub async fn get(&self, domain: &str, command_id: Uuid) -> CmdBusResult<CommandMetadata> {
        sqlx::query_as("select * from command where domain = $1 and command_id = $2")
            .bind(domain)
            .bind(command_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CmdBusError::command_not_found(domain, command_id))
    }

    /// `sp_receive_command` (spec.md §4.2). Runs on its own connection, not
    /// inside the handler's Phase 2 transaction — the row lock is held only
    /// for this statement's duration.
    pub async fn sp_receive_command(
        &self,
        domain: &str,
        command_id: Uuid,
        new_msg_id: i64,
    ) -> CmdBusResult<Option<CommandMetadata>> {
        let mut tx = self.pool.begin().await?;

        let locked: Option<CommandMetadata> = sqlx::query_as(
            "select * from command where domain = $1 and command_id = $2 for update",
        )
        .bind(domain)
        .bind(command_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = locked else {
            tx.commit().await?;
            return Ok(None);
        };

        if !row.status.is_receivable() {
            tx.commit().await?;
            return Ok(None);
        }

        let attempt = row.attempts + 1;
        let updated: CommandMetadata = sqlx::query_as(
            r#"
            update command
            set status = 'IN_PROGRESS', attempts = $3, msg_id = $4, updated_at = now()
            where domain = $1 and command_id = $2
            returning *
            "#,
        )
        .bind(domain)
        .bind(command_id)
        .bind(attempt)
        .bind(new_msg_id)
        .fetch_one(&mut *tx)
        .await?;

        insert_audit_event(
            &mut tx,
            command_id,
            AuditEventType::Received,
            Some(serde_json::json!({ "attempt": attempt })),
        )
        .await?;

        tx.commit().await?;
        Ok(Some(updated))
    }

    /// `sp_finish_command` (spec.md §4.2). Runs inside the caller's Phase 2
    /// transaction so handler writes, queue deletion, status update, audit,
    /// and batch counters commit or roll back together.
    pub async fn sp_finish_command(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &str,
        command_id: Uuid,
        args: &FinishCommandArgs,
    ) -> CmdBusResult<bool> {
        sqlx::query(
            r#"
            update command
            set status = $3,
                last_error_type = $4,
                last_error_code = $5,
                last_error_message = $6,
                updated_at = now()
            where domain = $1 and command_id = $2
            "#,
        )
        .bind(domain)
        .bind(command_id)
        .bind(args.status)
        .bind(&args.err_type)
        .bind(&args.err_code)
        .bind(&args.err_message)
        .execute(&mut **tx)
        .await?;

        insert_audit_event(tx, command_id, args.event_type, args.details.clone()).await?;

        match args.batch_id {
            Some(batch_id) => {
                let transition = BatchTransition::for_status(args.status);
                crate::repository::batch::BatchRepository::apply_transition_tx(
                    tx, domain, batch_id, transition,
                )
                .await
            }
            None => Ok(true),
        }
    }

    /// `sp_fail_command` (spec.md §4.2): used on retry scheduling. Keeps
    /// `status=IN_PROGRESS`; the caller separately defers the queue message
    /// with `set_visibility`.
    pub async fn sp_fail_command(
        &self,
        domain: &str,
        command_id: Uuid,
        err_type: &str,
        err_code: &str,
        err_message: &str,
    ) -> CmdBusResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            update command
            set last_error_type = $3, last_error_code = $4, last_error_message = $5, updated_at = now()
            where domain = $1 and command_id = $2
            "#,
        )
        .bind(domain)
        .bind(command_id)
        .bind(err_type)
        .bind(err_code)
        .bind(err_message)
        .execute(&mut *tx)
        .await?;

        insert_audit_event(
            &mut tx,
            command_id,
            AuditEventType::RetryScheduled,
            Some(serde_json::json!({ "err_type": err_type, "err_code": err_code })),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn query_commands(
        &self,
        domain: Option<&str>,
        command_type: Option<&str>,
        status: Option<CommandStatus>,
        created_after: Option<DateTime<Utc>>,
        created_before: Option<DateTime<Utc>>,
        limit: i64,
        offset: i64,
    ) -> CmdBusResult<Vec<CommandMetadata>> {
        let rows: Vec<CommandMetadata> = sqlx::query_as(
            r#"
            select * from command
            where ($1::text is null or domain = $1)
              and ($2::text is null or command_type = $2)
              and ($3::text is null or status = $3)
              and ($4::timestamptz is null or created_at >= $4)
              and ($5::timestamptz is null or created_at <= $5)
            order by created_at desc
            limit $6 offset $7
            "#,
        )
        .bind(domain)
        .bind(command_type)
        .bind(status)
        .bind(created_after)
        .bind(created_before)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// Which batch counter a terminal transition touches (spec.md §4.2's
/// "batch counter discipline").
#[derive(Debug, Clone, Copy)]
pub enum BatchTransition {
    ToCompleted,
    ToCanceled,
    ToTsq,
    None,
}

impl BatchTransition {
    fn for_status(status: CommandStatus) -> Self {
        match status {
            CommandStatus::Completed => Self::ToCompleted,
            CommandStatus::Canceled => Self::ToCanceled,
            CommandStatus::InTroubleshootingQueue => Self::ToTsq,
            _ => Self::None,
        }
    }
}

pub(crate) async fn insert_audit_event(
    tx: &mut Transaction<'_, Postgres>,
    command_id: Uuid,
    event_type: AuditEventType,
    details: Option<Value>,
) -> CmdBusResult<()> {
    sqlx::query("insert into audit (command_id, event_type, ts, details) values ($1, $2, now(), $3)")
        .bind(command_id)
        .bind(event_type)
        .bind(details)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
