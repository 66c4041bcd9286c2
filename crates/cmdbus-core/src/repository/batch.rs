//! Batch Repository (C3): persistence plus the TSQ transition procedures
//! (spec.md §4.3). Batches are closed at creation — no commands are added
//! later — so the only mutation surface is the four counters.

use cmdbus_shared::{CmdBusError, CmdBusResult};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{Batch, BatchStatus};
use crate::repository::command::BatchTransition;

#[derive(Debug, Clone)]
pub struct NewBatch {
    pub domain: String,
    pub batch_id: Uuid,
    pub name: Option<String>,
    pub custom_data: Option<Value>,
    pub total_count: i32,
}

pub struct BatchRepository {
    pool: PgPool,
}

impl BatchRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        batch: &NewBatch,
    ) -> CmdBusResult<Batch> {
        let row: Batch = sqlx::query_as(
            r#"
            insert into batch
                (domain, batch_id, name, custom_data, status, total_count,
                 completed_count, canceled_count, in_troubleshooting_count,
                 created_at, updated_at)
            values
                ($1, $2, $3, $4, 'PENDING', $5, 0, 0, 0, now(), now())
            returning *
            "#,
        )
        .bind(&batch.domain)
        .bind(batch.batch_id)
        .bind(&batch.name)
        .bind(&batch.custom_data)
        .bind(batch.total_count)
        .fetch_one(&mut **tx)
        .await?;
        Ok(row)
    }

    pub async fn get(&self, domain: &str, batch_id: Uuid) -> CmdBusResult<Batch> {
        sqlx::query_as("select * from batch where domain = $1 and batch_id = $2")
            .bind(domain)
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CmdBusError::batch_not_found(domain, batch_id))
    }

    pub async fn list(&self, domain: &str, limit: i64, offset: i64) -> CmdBusResult<Vec<Batch>> {
        let rows: Vec<Batch> = sqlx::query_as(
            "select * from batch where domain = $1 order by created_at desc limit $2 offset $3",
        )
        .bind(domain)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Applied from `sp_finish_command` (spec.md §4.2) on a command's first
    /// arrival at a terminal/TSQ status. Returns whether the batch is now
    /// complete (`completed + canceled = total`).
    pub async fn apply_transition_tx(
        tx: &mut Transaction<'_, Postgres>,
        domain: &str,
        batch_id: Uuid,
        transition: BatchTransition,
    ) -> CmdBusResult<bool> {
        let (completed_delta, canceled_delta, tsq_delta) = match transition {
            BatchTransition::ToCompleted => (1, 0, 0),
            BatchTransition::ToCanceled => (0, 1, 0),
            BatchTransition::ToTsq => (0, 0, 1),
            BatchTransition::None => return Ok(false),
        };
        apply_counter_delta_tx(tx, domain, batch_id, completed_delta, canceled_delta, tsq_delta).await
    }

    /// Operator retry (spec.md §4.8): decrements `in_troubleshooting_count`,
    /// awaiting a fresh attempt; no completed/canceled change.
    pub async fn sp_tsq_retry(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &str,
        batch_id: Uuid,
    ) -> CmdBusResult<bool> {
        apply_counter_delta_tx(tx, domain, batch_id, 0, 0, -1).await
    }

    /// Operator cancel (spec.md §4.8): moves a TSQ command to `CANCELED`.
    pub async fn sp_tsq_cancel(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &str,
        batch_id: Uuid,
    ) -> CmdBusResult<bool> {
        apply_counter_delta_tx(tx, domain, batch_id, 0, 1, -1).await
    }

    /// Operator complete (spec.md §4.8): moves a TSQ command to `COMPLETED`.
    pub async fn sp_tsq_complete(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &str,
        batch_id: Uuid,
    ) -> CmdBusResult<bool> {
        apply_counter_delta_tx(tx, domain, batch_id, 1, 0, -1).await
    }
}

async fn apply_counter_delta_tx(
    tx: &mut Transaction<'_, Postgres>,
    domain: &str,
    batch_id: Uuid,
    completed_delta: i32,
    canceled_delta: i32,
    tsq_delta: i32,
) -> CmdBusResult<bool> {
    let row: Batch = sqlx::query_as(
        r#"
        update batch
        set completed_count = completed_count + $3,
            canceled_count = canceled_count + $4,
            in_troubleshooting_count = in_troubleshooting_count + $5,
            updated_at = now()
        where domain = $1 and batch_id = $2
        returning *
        "#,
    )
    .bind(domain)
    .bind(batch_id)
    .bind(completed_delta)
    .bind(canceled_delta)
    .bind(tsq_delta)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| CmdBusError::batch_not_found(domain, batch_id))?;

    let new_status = row.derive_status();
    sqlx::query("update batch set status = $3 where domain = $1 and batch_id = $2")
        .bind(domain)
        .bind(batch_id)
        .bind(new_status)
        .execute(&mut **tx)
        .await?;

    Ok(row.is_complete())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_status_matches_conservation_invariant() {
        let mut b = Batch {
            domain: "d".into(),
            batch_id: Uuid::nil(),
            name: None,
            custom_data: None,
            status: BatchStatus::Pending,
            total_count: 5,
            completed_count: 0,
            canceled_count: 0,
            in_troubleshooting_count: 0,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        assert_eq!(b.derive_status(), BatchStatus::Pending);
        b.completed_count = 5;
        assert!(b.is_complete());
        assert_eq!(b.derive_status(), BatchStatus::Completed);
    }
}
