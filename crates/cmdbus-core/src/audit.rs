//! Audit Logger (C4): append-only event log for commands (spec.md §4.4).
//! Never updated or deleted by the core; one-shot and batched insert.

use cmdbus_shared::CmdBusResult;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{AuditEvent, AuditEventType};

pub struct AuditLogger {
    pool: PgPool,
}

impl AuditLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn record(
        &self,
        command_id: Uuid,
        event_type: AuditEventType,
        details: Option<Value>,
    ) -> CmdBusResult<()> {
        sqlx::query("insert into audit (command_id, event_type, ts, details) values ($1, $2, now(), $3)")
            .bind(command_id)
            .bind(event_type)
            .bind(details)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        command_id: Uuid,
        event_type: AuditEventType,
        details: Option<Value>,
    ) -> CmdBusResult<()> {
        crate::repository::command::insert_audit_event(tx, command_id, event_type, details).await
    }

    /// Batched insert for the Command Bus's `send_batch`/`create_batch`
    /// paths (spec.md §4.6): one round trip per chunk, not one per row.
    pub async fn record_batch_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        command_ids: &[Uuid],
        event_type: AuditEventType,
    ) -> CmdBusResult<()> {
        if command_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "insert into audit (command_id, event_type, ts, details)
             select x, $2, now(), null from unnest($1::uuid[]) as t(x)",
        )
        .bind(command_ids)
        .bind(event_type)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn trail(&self, command_id: Uuid) -> CmdBusResult<Vec<AuditEvent>> {
        let rows: Vec<AuditEvent> = sqlx::query_as(
            "select * from audit where command_id = $1 order by ts asc",
        )
        .bind(command_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
