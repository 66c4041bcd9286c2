//! Process Reply Router (C10): the long-running consumer of
//! `<domain>__process_replies` that feeds replies back into
//! [`crate::manager::ProcessManagerRuntime::handle_reply`] (spec.md §4.10).
//!
//! Shares the worker's bounded-concurrency, LISTEN-or-poll, graceful-drain
//! loop shape (spec.md §4.7.1-§4.7.2) rather than depending on
//! `cmdbus-worker` for it: a process reply carries no attempts/backoff
//! state of its own, so the loop here is the worker's minus the retry
//! machinery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cmdbus_pgmq::{QueueClient, QueueListener};
use cmdbus_shared::wire::{QueueNames, ReplyEnvelope};
use cmdbus_shared::config::WorkerConfig;
use cmdbus_shared::CmdBusResult;

use crate::manager::ProcessManagerRuntime;

pub struct ProcessReplyRouter {
    domain: String,
    runtime: Arc<ProcessManagerRuntime>,
    queue: QueueClient,
    config: WorkerConfig,
    shutdown: Arc<AtomicBool>,
}

impl ProcessReplyRouter {
    pub fn new(domain: impl Into<String>, runtime: Arc<ProcessManagerRuntime>, queue: QueueClient, config: WorkerConfig) -> Self {
        Self {
            domain: domain.into(),
            runtime,
            queue,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub async fn run(&self) -> CmdBusResult<()> {
        let queue_name = QueueNames::process_replies(&self.domain);
        self.queue
            .ensure_queue(&queue_name)
            .await
            .map_err(|e| cmdbus_shared::CmdBusError::queue(e.to_string()))?;

        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.config.concurrency));
        let mut tasks = tokio::task::JoinSet::new();
        let mut listener = if self.config.use_notify {
            Some(
                QueueListener::new(self.queue.pool().clone(), &queue_name)
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
            match &mut listener {
                Some(listener) => {
                    listener.wait(self.config.poll_interval()).await;
                }
                None => {
                    tokio::time::sleep(self.config.poll_interval()).await;
                }
            }
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
                .queue
                .read::<ReplyEnvelope>(queue_name, self.config.visibility_timeout(), available as i32)
                .await
                .map_err(|e| cmdbus_shared::CmdBusError::queue(e.to_string()))?;

            if messages.is_empty() {
                return Ok(());
            }

            for msg in messages {
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
                let runtime = self.runtime.clone();
                let queue = self.queue.clone();
                let domain = self.domain.clone();
                let queue_name = queue_name.to_string();
                tasks.spawn(async move {
                    if let Err(err) = runtime.handle_reply(&domain, &msg.payload, &queue, &queue_name, msg.msg_id).await {
                        tracing::error!(domain = %domain, command_id = %msg.payload.command_id, error = %err, "process reply handling failed");
                    }
                    drop(permit);
                });
            }

            tokio::task::yield_now().await;
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
                    tracing::warn!(domain = %self.domain, remaining = tasks.len(), "shutdown timeout reached with process replies still in flight");
                    return;
                }
            }
        }
    }
}
