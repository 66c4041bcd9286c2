//! Process + process-audit persistence, grounded on the same
//! transaction-scoped query style `cmdbus-core::repository` uses.

use cmdbus_shared::{CmdBusError, CmdBusResult};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{Process, ProcessAuditEntry, ProcessStatus};

pub struct ProcessRepository {
    pool: PgPool,
}

impl ProcessRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &str,
        process_id: Uuid,
        process_type: &str,
        current_step: &str,
        state: Value,
    ) -> CmdBusResult<Process> {
        let row: Process = sqlx::query_as(
            r#"
            insert into process
                (domain, process_id, process_type, status, current_step, state,
                 compensating, pending_compensations, created_at, updated_at)
            values
                ($1, $2, $3, 'PENDING', $4, $5, false, '[]'::jsonb, now(), now())
            returning *
            "#,
        )
        .bind(domain)
        .bind(process_id)
        .bind(process_type)
        .bind(current_step)
        .bind(state)
        .fetch_one(&mut **tx)
        .await?;
        Ok(row)
    }

    pub async fn get(&self, domain: &str, process_id: Uuid) -> CmdBusResult<Process> {
        sqlx::query_as("select * from process where domain = $1 and process_id = $2")
            .bind(domain)
            .bind(process_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CmdBusError::process_not_found(domain, process_id))
    }

    pub async fn get_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &str,
        process_id: Uuid,
    ) -> CmdBusResult<Process> {
        sqlx::query_as("select * from process where domain = $1 and process_id = $2 for update")
            .bind(domain)
            .bind(process_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| CmdBusError::process_not_found(domain, process_id))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn update_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &str,
        process_id: Uuid,
        status: ProcessStatus,
        current_step: &str,
        state: &Value,
        compensating: bool,
        pending_compensations: &Value,
        compensation_target: Option<ProcessStatus>,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> CmdBusResult<()> {
        sqlx::query(
            r#"
            update process
            set status = $3, current_step = $4, state = $5,
                compensating = $6, pending_compensations = $7, compensation_target = $8,
                error_code = $9, error_message = $10, updated_at = now()
            where domain = $1 and process_id = $2
            "#,
        )
        .bind(domain)
        .bind(process_id)
        .bind(status)
        .bind(current_step)
        .bind(state)
        .bind(compensating)
        .bind(pending_compensations)
        .bind(compensation_target)
        .bind(error_code)
        .bind(error_message)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn insert_audit_entry_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        process_id: Uuid,
        step_name: &str,
        command_id: Uuid,
        command_type: &str,
        command_data: &Value,
    ) -> CmdBusResult<()> {
        sqlx::query(
            r#"
            insert into process_audit
                (process_id, step_name, command_id, command_type, command_data, sent_at)
            values
                ($1, $2, $3, $4, $5, now())
            "#,
        )
        .bind(process_id)
        .bind(step_name)
        .bind(command_id)
        .bind(command_type)
        .bind(command_data)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Stamps the audit row identified by `command_id` (spec.md §4.9.3
    /// step 1).
    pub async fn stamp_reply_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        command_id: Uuid,
        reply_outcome: &str,
        reply_data: Option<&Value>,
    ) -> CmdBusResult<()> {
        sqlx::query(
            r#"
            update process_audit
            set reply_outcome = $2, reply_data = $3, received_at = now()
            where command_id = $1
            "#,
        )
        .bind(command_id)
        .bind(reply_outcome)
        .bind(reply_data)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// All audit entries for a process, in **reverse `sent_at` order**
    /// (spec.md §4.9.4's compensation ordering).
    pub async fn audit_entries_reverse_sent(&self, process_id: Uuid) -> CmdBusResult<Vec<ProcessAuditEntry>> {
        let rows: Vec<ProcessAuditEntry> = sqlx::query_as(
            "select * from process_audit where process_id = $1 order by sent_at desc",
        )
        .bind(process_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
