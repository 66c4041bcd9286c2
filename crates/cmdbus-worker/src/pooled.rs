//! Thread-pooled worker (spec.md §4.7.1's second scheduling shape): a
//! fixed-size pool of `N` OS threads, each processing one message at a
//! time on its own single-threaded runtime. Shares [`WorkerCore`] with the
//! cooperative [`crate::worker::Worker`] — the state-machine contract is
//! identical; only the concurrency mechanism differs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use cmdbus_core::{Command, CommandBus, HandlerRegistry};
use cmdbus_pgmq::QueueMessage;
use cmdbus_shared::config::WorkerConfig;
use cmdbus_shared::wire::QueueNames;
use cmdbus_shared::CmdBusResult;

use crate::health::{HealthThresholds, HealthTracker};
use crate::retry::RetryPolicy;
use crate::worker::WorkerCore;

/// Dispatches `queue.read` results onto a bounded channel; `N` worker
/// threads pull from it, each holding one checked-out connection's worth
/// of work for the lifetime of one message's Phase 2 (spec.md §5).
pub struct PooledWorker {
    core: Arc<WorkerCore>,
    config: WorkerConfig,
    shutdown: Arc<AtomicBool>,
    health: Arc<HealthTracker>,
}

impl PooledWorker {
    pub fn new(
        domain: impl Into<String>,
        bus: Arc<CommandBus>,
        registry: Arc<HandlerRegistry>,
        retry_policy: RetryPolicy,
        config: WorkerConfig,
    ) -> Self {
        let visibility_timeout = config.visibility_timeout();
        Self {
            core: Arc::new(WorkerCore {
                domain: domain.into(),
                bus,
                registry,
                retry_policy,
                metrics: Arc::new(crate::worker::WorkerMetrics::default()),
            }),
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            health: Arc::new(HealthTracker::new(HealthThresholds::default(), visibility_timeout)),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn metrics(&self) -> crate::worker::WorkerMetricsSnapshot {
        self.core.metrics.snapshot()
    }

    /// Blocking entry point: spawns the pool, polls the queue on the
    /// calling thread using `runtime_handle`, and returns once shutdown
    /// drains within `config.shutdown_timeout()`.
    pub fn run(&self, runtime_handle: tokio::runtime::Handle) -> CmdBusResult<()> {
        let queue_name = QueueNames::commands(&self.core.domain);
        runtime_handle.block_on(self.core.bus.queue().ensure_queue(&queue_name))
            .map_err(|e| cmdbus_shared::CmdBusError::queue(e.to_string()))?;

        let (tx, rx) = mpsc::sync_channel::<QueueMessage<Command>>(self.config.concurrency);
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(self.config.concurrency);
        for _ in 0..self.config.concurrency {
            let core = self.core.clone();
            let rx = rx.clone();
            let health = self.health.clone();
            let handle = runtime_handle.clone();
            let queue_name = queue_name.clone();
            handles.push(std::thread::spawn(move || {
                worker_thread_loop(core, rx, health, handle, queue_name);
            }));
        }

        while !self.shutdown.load(Ordering::SeqCst) {
            let available = self.config.concurrency.saturating_sub(self.core.metrics.in_flight.load(Ordering::Relaxed).max(0) as usize);
            if available == 0 {
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }

            let messages = runtime_handle
                .block_on(self.core.bus.queue().read::<Command>(&queue_name, self.config.visibility_timeout(), available as i32))
                .map_err(|e| cmdbus_shared::CmdBusError::queue(e.to_string()))?;

            if messages.is_empty() {
                std::thread::sleep(self.config.poll_interval());
                continue;
            }

            for msg in messages {
                if tx.send(msg).is_err() {
                    break;
                }
            }
        }

        drop(tx);
        let deadline = std::time::Instant::now() + self.config.shutdown_timeout();
        for handle in handles {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                tracing::warn!(domain = %self.core.domain, "shutdown timeout reached with pool threads still running");
                break;
            }
            let _ = handle.join();
        }

        Ok(())
    }
}

fn worker_thread_loop(
    core: Arc<WorkerCore>,
    rx: Arc<Mutex<mpsc::Receiver<QueueMessage<Command>>>>,
    health: Arc<HealthTracker>,
    handle: tokio::runtime::Handle,
    queue_name: String,
) {
    loop {
        let msg = {
            let guard = rx.lock().expect("pooled worker channel mutex poisoned");
            guard.recv()
        };
        let Ok(msg) = msg else {
            return;
        };
        let ok = handle.block_on(core.process_one_tracked(&queue_name, msg));
        if ok {
            health.record_success();
        } else {
            health.record_failure();
        }
    }
}
