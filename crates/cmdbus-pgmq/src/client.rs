//! # Queue Client (C1)
//!
//! Thin wrapper over the `pgmq` crate plus a raw `pg_notify` side channel.
//! Every operation accepts an optional caller-supplied transaction so the
//! worker's Phase 2 (spec.md §4.7.3) can compose a queue delete with the
//! command-finish stored procedure in one commit.
//!
//! A struct (not a trait object) wrapping the messaging backend, with an
//! optional circuit breaker protecting the send/receive path while queue
//! management and lifecycle operations bypass it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use cmdbus_shared::resilience::CircuitBreaker;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};

/// A message read off a queue, with enough metadata to act on its lease.
#[derive(Debug, Clone)]
pub struct QueueMessage<T> {
    pub msg_id: i64,
    pub read_count: i32,
    pub enqueued_at: DateTime<Utc>,
    pub visible_at: DateTime<Utc>,
    pub payload: T,
}

/// Summary statistics for one queue (supplemented: spec.md §9's worker
/// health component and the operator CLI both need this).
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub queue_length: i64,
    pub newest_msg_age_seconds: Option<i64>,
    pub oldest_msg_age_seconds: Option<i64>,
}

/// Thin wrapper over PGMQ's send/read/delete/archive/set-vt primitives plus
/// a `pg_notify` side channel on `pgmq_notify_<queue>`.
#[derive(Clone)]
pub struct QueueClient {
    pool: PgPool,
    queue: Arc<pgmq::PGMQueueExt<Postgres>>,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
}

impl std::fmt::Debug for QueueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueClient")
            .field("has_circuit_breaker", &self.circuit_breaker.is_some())
            .finish()
    }
}

impl QueueClient {
    /// Build a client over an existing pool. The pool is shared with
    /// everything else in the process (spec.md §5's shared-resource policy).
    pub async fn new(pool: PgPool) -> QueueResult<Self> {
        let queue = pgmq::PGMQueueExt::new_with_pool(pool.clone()).await;
        Ok(Self {
            pool,
            queue: Arc::new(queue),
            circuit_breaker: None,
        })
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = Some(circuit_breaker);
        self
    }

    async fn with_breaker<F, T, Fut>(&self, op: F) -> QueueResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = QueueResult<T>>,
    {
        use cmdbus_shared::resilience::CircuitBreakerBehavior;

        let Some(cb) = &self.circuit_breaker else {
            return op().await;
        };
        if !cb.should_allow() {
            return Err(QueueError::circuit_breaker_open("queue"));
        }
        let start = Instant::now();
        let result = op().await;
        match &result {
            Ok(_) => cb.record_success_manual(start.elapsed()),
            Err(_) => cb.record_failure_manual(start.elapsed()),
        }
        result
    }

    /// Create the queue (and its archive table) if it doesn't already
    /// exist. Idempotent.
    pub async fn ensure_queue(&self, queue_name: &str) -> QueueResult<()> {
        self.queue.create(queue_name).await?;
        Ok(())
    }

    /// Enqueue one payload and emit a NOTIFY on `pgmq_notify_<queue>`.
    pub async fn send<T: Serialize + Sync>(
        &self,
        queue_name: &str,
        payload: &T,
        delay_seconds: i64,
    ) -> QueueResult<i64> {
        self.with_breaker(|| async move {
            let msg_id = self.queue.send_delay(queue_name, payload, delay_seconds as u32).await?;
            self.notify(queue_name).await?;
            Ok(msg_id)
        })
        .await
    }

    /// Same as `send`, but inside a caller-supplied transaction and without
    /// emitting NOTIFY — matches spec.md §4.6's per-chunk behavior in
    /// `send_batch`: callers emit one NOTIFY per chunk themselves.
    pub async fn send_batch<T: Serialize + Sync>(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        queue_name: &str,
        payloads: &[T],
        delay_seconds: i64,
    ) -> QueueResult<Vec<i64>> {
        let mut ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let body = serde_json::to_value(payload)?;
            let row: (i64,) = sqlx::query_as(&format!(
                "select * from pgmq.send(queue_name => $1, msg => $2, delay => $3)"
            ))
            .bind(queue_name)
            .bind(body)
            .bind(delay_seconds as i32)
            .fetch_one(&mut **tx)
            .await?;
            ids.push(row.0);
        }
        Ok(ids)
    }

    /// Emit a NOTIFY on the queue's channel without sending a message.
    pub async fn notify(&self, queue_name: &str) -> QueueResult<()> {
        let channel = cmdbus_shared::wire::QueueNames::notify_channel(queue_name);
        sqlx::query("select pg_notify($1, $2)")
            .bind(&channel)
            .bind(queue_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Read up to `batch_size` not-currently-visible messages, bumping
    /// their visibility to `now + visibility_timeout` and incrementing
    /// their read count.
    pub async fn read<T: DeserializeOwned + Unpin + Send + Sync>(
        &self,
        queue_name: &str,
        visibility_timeout: Duration,
        batch_size: i32,
    ) -> QueueResult<Vec<QueueMessage<T>>> {
        self.with_breaker(|| async move {
            let vt = visibility_timeout.as_secs() as i32;
            let rows = self
                .queue
                .read_batch::<T>(queue_name, Some(vt), batch_size)
                .await?
                .unwrap_or_default();
            Ok(rows
                .into_iter()
                .map(|m| QueueMessage {
                    msg_id: m.msg_id,
                    read_count: m.read_ct,
                    enqueued_at: m.enqueued_at,
                    visible_at: m.vt,
                    payload: m.message,
                })
                .collect())
        })
        .await
    }

    /// Delete a message outright (used on successful completion, and for
    /// `BusinessRuleException` which bypasses the archive entirely).
    pub async fn delete(&self, queue_name: &str, msg_id: i64) -> QueueResult<bool> {
        Ok(self.queue.delete(queue_name, msg_id).await?)
    }

    /// Delete within an existing transaction (spec.md §4.7.3 Phase 2: the
    /// delete commits atomically with `sp_finish_command`).
    pub async fn delete_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        queue_name: &str,
        msg_id: i64,
    ) -> QueueResult<bool> {
        let sql = format!("select pgmq.delete('{queue_name}', $1::bigint)");
        let row: (bool,) = sqlx::query_as(&sql).bind(msg_id).fetch_one(&mut **tx).await?;
        Ok(row.0)
    }

    /// Move a message to the archive table (retryable/permanent failure
    /// escalation to TSQ, spec.md §4.7.4).
    pub async fn archive(&self, queue_name: &str, msg_id: i64) -> QueueResult<bool> {
        Ok(self.queue.archive(queue_name, msg_id).await?)
    }

    pub async fn archive_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        queue_name: &str,
        msg_id: i64,
    ) -> QueueResult<bool> {
        let sql = format!("select pgmq.archive('{queue_name}', $1::bigint)");
        let row: (bool,) = sqlx::query_as(&sql).bind(msg_id).fetch_one(&mut **tx).await?;
        Ok(row.0)
    }

    /// Extend (or shorten) the visibility timeout for a message. Used both
    /// to extend during long handlers and to defer after a transient
    /// failure with a backoff delay.
    pub async fn set_visibility(
        &self,
        queue_name: &str,
        msg_id: i64,
        seconds_from_now: i64,
    ) -> QueueResult<()> {
        self.queue
            .set_vt::<serde_json::Value>(queue_name, msg_id, seconds_from_now as i32)
            .await?;
        Ok(())
    }

    /// Reverse lookup into a queue's archive table by the `command_id`
    /// field embedded in the original payload. Used by operator retry
    /// (spec.md §4.8) to recover the original command body.
    pub async fn get_from_archive<T: DeserializeOwned>(
        &self,
        queue_name: &str,
        command_id: Uuid,
    ) -> QueueResult<Option<QueueMessage<T>>> {
        let archive_table = format!("pgmq.a_{queue_name}");
        let sql = format!(
            "select msg_id, read_ct, enqueued_at, archived_at, message \
             from {archive_table} where message->>'command_id' = $1 \
             order by archived_at desc limit 1"
        );
        let row: Option<(i64, i32, DateTime<Utc>, DateTime<Utc>, serde_json::Value)> =
            sqlx::query_as(&sql)
                .bind(command_id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((msg_id, read_ct, enqueued_at, archived_at, message)) => {
                let payload: T = serde_json::from_value(message)?;
                Ok(Some(QueueMessage {
                    msg_id,
                    read_count: read_ct,
                    enqueued_at,
                    visible_at: archived_at,
                    payload,
                }))
            }
            None => Ok(None),
        }
    }

    /// Queue depth and message age, for worker health and the operator CLI.
    pub async fn queue_stats(&self, queue_name: &str) -> QueueResult<QueueStats> {
        let sql = format!(
            "select count(*)::bigint as queue_length, \
             extract(epoch from (now() - min(enqueued_at)))::bigint as oldest, \
             extract(epoch from (now() - max(enqueued_at)))::bigint as newest \
             from pgmq.q_{queue_name}"
        );
        let row: (i64, Option<i64>, Option<i64>) =
            sqlx::query_as(&sql).fetch_one(&self.pool).await?;
        Ok(QueueStats {
            queue_length: row.0,
            oldest_msg_age_seconds: row.1,
            newest_msg_age_seconds: row.2,
        })
    }

    pub async fn health_check(&self) -> QueueResult<bool> {
        sqlx::query("select 1").execute(&self.pool).await?;
        Ok(true)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_stats_default_is_empty() {
        let stats = QueueStats::default();
        assert_eq!(stats.queue_length, 0);
        assert!(stats.newest_msg_age_seconds.is_none());
    }
}
