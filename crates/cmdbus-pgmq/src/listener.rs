//! Wakeup side channel: a `LISTEN` on a queue's NOTIFY channel with a
//! polling fallback, racing a `PgListener` against a poll-interval timer
//! rather than trusting NOTIFY exclusively (missed notifications during a
//! reconnect must not stall a worker forever).

use std::time::Duration;

use sqlx::postgres::PgListener;
use sqlx::PgPool;

use crate::error::QueueResult;

/// Waits for either a NOTIFY on the queue's channel or a poll-interval
/// timeout, whichever comes first. Reconnects the underlying listener on
/// error rather than propagating it — a dropped `LISTEN` connection should
/// degrade to poll-only, not kill the worker loop.
pub struct QueueListener {
    pool: PgPool,
    channel: String,
    listener: Option<PgListener>,
}

impl QueueListener {
    pub async fn new(pool: PgPool, queue_name: &str) -> QueueResult<Self> {
        let channel = cmdbus_shared::wire::QueueNames::notify_channel(queue_name);
        let mut this = Self {
            pool,
            channel,
            listener: None,
        };
        this.reconnect().await;
        Ok(this)
    }

    async fn reconnect(&mut self) {
        match PgListener::connect_with(&self.pool).await {
            Ok(mut listener) => {
                if let Err(err) = listener.listen(&self.channel).await {
                    tracing::warn!(channel = %self.channel, error = %err, "failed to LISTEN, falling back to polling");
                    self.listener = None;
                } else {
                    self.listener = Some(listener);
                }
            }
            Err(err) => {
                tracing::warn!(channel = %self.channel, error = %err, "failed to connect listener, falling back to polling");
                self.listener = None;
            }
        }
    }

    /// Block until notified or `poll_interval` elapses. Returns `true` if
    /// woken by an actual NOTIFY, `false` if it timed out (a plain poll
    /// tick).
    pub async fn wait(&mut self, poll_interval: Duration) -> bool {
        let Some(listener) = self.listener.as_mut() else {
            tokio::time::sleep(poll_interval).await;
            self.reconnect().await;
            return false;
        };

        tokio::select! {
            result = listener.recv() => {
                match result {
                    Ok(_notification) => true,
                    Err(err) => {
                        tracing::warn!(channel = %self.channel, error = %err, "listener recv failed, reconnecting");
                        self.listener = None;
                        false
                    }
                }
            }
            _ = tokio::time::sleep(poll_interval) => false,
        }
    }
}
