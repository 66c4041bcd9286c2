//! End-to-end coverage of the process manager's saga lifecycle (spec.md
//! §4.9, §8's S-Process-Happy-Path and S-Process-Compensation scenarios)
//! against a live Postgres database. Run with
//! `cargo test --features test-db --test process_lifecycle`.

#![cfg(feature = "test-db")]

use std::sync::Arc;

use async_trait::async_trait;
use cmdbus_core::{Command, CommandBus, CommandHandler, HandlerContext, HandlerError, HandlerRegistry};
use cmdbus_pgmq::QueueClient;
use cmdbus_process::manager::{ProcessManager, ProcessManagerRegistry, ProcessManagerRuntime};
use cmdbus_process::models::ProcessStatus;
use cmdbus_process::repository::ProcessRepository;
use cmdbus_shared::config::BusConfig;
use cmdbus_shared::wire::{QueueNames, ReplyEnvelope};
use cmdbus_worker::retry::RetryPolicy;
use cmdbus_worker::WorkerCore;
use serde_json::{json, Value};
use serial_test::serial;
use sqlx::postgres::PgPoolOptions;

async fn test_pool() -> sqlx::PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for test-db tests");
    PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to test database")
}

/// A two-step transfer saga: debit then credit, with a compensation
/// ("refund") mapped only to the debit step.
struct TransferManager;

impl ProcessManager for TransferManager {
    fn process_type(&self) -> &str {
        "transfer"
    }

    fn domain(&self) -> &str {
        "payments"
    }

    fn create_initial_state(&self, initial_data: Value) -> cmdbus_shared::CmdBusResult<Value> {
        Ok(initial_data)
    }

    fn get_first_step(&self, _state: &Value) -> cmdbus_shared::CmdBusResult<String> {
        Ok("debit".to_string())
    }

    fn build_command(&self, step: &str, state: &Value) -> cmdbus_shared::CmdBusResult<(String, Value)> {
        match step {
            "debit" => Ok(("DebitAccount".to_string(), state.clone())),
            "credit" => Ok(("CreditAccount".to_string(), state.clone())),
            "refund" => Ok(("RefundAccount".to_string(), state.clone())),
            other => Err(cmdbus_shared::CmdBusError::invalid_operation(format!("unknown step {other}"))),
        }
    }

    fn update_state(&self, state: &Value, step: &str, reply: &ReplyEnvelope) -> cmdbus_shared::CmdBusResult<Value> {
        let mut state = state.clone();
        if let Some(obj) = state.as_object_mut() {
            obj.insert(format!("{step}_result"), reply.result.clone().unwrap_or(Value::Null));
        }
        Ok(state)
    }

    fn get_next_step(&self, current_step: &str, _reply: &ReplyEnvelope, _state: &Value) -> cmdbus_shared::CmdBusResult<Option<String>> {
        match current_step {
            "debit" => Ok(Some("credit".to_string())),
            "credit" => Ok(None),
            "refund" => Ok(None),
            other => Err(cmdbus_shared::CmdBusError::invalid_operation(format!("unknown step {other}"))),
        }
    }

    fn get_compensation_step(&self, step: &str) -> Option<String> {
        match step {
            "debit" => Some("refund".to_string()),
            _ => None,
        }
    }
}

struct AlwaysSucceeds;

#[async_trait]
impl CommandHandler for AlwaysSucceeds {
    async fn handle(&self, command: &Command, _ctx: &HandlerContext) -> Result<Value, HandlerError> {
        Ok(json!({"accepted": command.data.clone()}))
    }
}

struct RejectsCredit;

#[async_trait]
impl CommandHandler for RejectsCredit {
    async fn handle(&self, _command: &Command, _ctx: &HandlerContext) -> Result<Value, HandlerError> {
        Err(HandlerError::business_rule("NO_ACCT", "destination account does not exist"))
    }
}

struct Harness {
    bus: Arc<CommandBus>,
    core: WorkerCore,
    runtime: Arc<ProcessManagerRuntime>,
    commands_queue: String,
    replies_queue: String,
}

impl Harness {
    async fn new(registry: HandlerRegistry, manager: Arc<dyn ProcessManager>) -> Self {
        let domain = manager.domain().to_string();
        let pool = test_pool().await;
        let queue = QueueClient::new(pool.clone()).await.unwrap();
        let bus = Arc::new(CommandBus::new(pool.clone(), queue.clone(), 3, 1000));

        let commands_queue = QueueNames::commands(&domain);
        let replies_queue = QueueNames::process_replies(&domain);
        bus.queue().ensure_queue(&commands_queue).await.unwrap();
        bus.queue().ensure_queue(&replies_queue).await.unwrap();

        let mut process_registry = ProcessManagerRegistry::new();
        process_registry.register(manager).unwrap();
        let repo = ProcessRepository::new(pool.clone());
        let runtime = Arc::new(ProcessManagerRuntime::new(bus.clone(), repo, Arc::new(process_registry)));

        let core = WorkerCore {
            domain,
            bus: bus.clone(),
            registry: Arc::new(registry),
            retry_policy: RetryPolicy::new(BusConfig {
                default_max_attempts: 3,
                backoff_schedule_seconds: vec![0, 0, 0],
            }),
            metrics: Arc::new(Default::default()),
        };

        Self { bus, core, runtime, commands_queue, replies_queue }
    }

    /// Processes one outstanding step: receives its command, dispatches the
    /// handler (which replies to the process-replies queue), then feeds
    /// that reply back through the runtime.
    async fn drive_one_step(&self) {
        let mut msgs = self
            .bus
            .queue()
            .read::<Command>(&self.commands_queue, std::time::Duration::from_secs(30), 1)
            .await
            .unwrap();
        assert_eq!(msgs.len(), 1, "expected exactly one in-flight step command");
        let msg = msgs.remove(0);
        self.core.process_one(&self.commands_queue, msg).await;

        let mut replies = self
            .bus
            .queue()
            .read::<ReplyEnvelope>(&self.replies_queue, std::time::Duration::from_secs(30), 1)
            .await
            .unwrap();
        assert_eq!(replies.len(), 1, "expected exactly one process reply");
        let reply_msg = replies.remove(0);
        self.runtime
            .handle_reply(&self.core.domain, &reply_msg.payload, self.bus.queue(), &self.replies_queue, reply_msg.msg_id)
            .await
            .unwrap();
    }
}

/// S-Process-Happy-Path: a two-step saga where both steps succeed ends
/// `COMPLETED`, with both `ProcessAuditEntry` rows stamped with their
/// replies in `sent_at` order.
#[tokio::test]
#[serial]
async fn two_step_saga_completes_when_both_steps_succeed() {
    let mut registry = HandlerRegistry::new();
    registry.register("payments", "DebitAccount", Arc::new(AlwaysSucceeds)).unwrap();
    registry.register("payments", "CreditAccount", Arc::new(AlwaysSucceeds)).unwrap();
    let harness = Harness::new(registry, Arc::new(TransferManager)).await;

    let process_id = harness
        .runtime
        .start("payments", "transfer", None, json!({"amount": 100}))
        .await
        .unwrap();

    let process = harness.runtime.repo().get("payments", process_id).await.unwrap();
    assert_eq!(process.status, ProcessStatus::WaitingForReply);
    assert_eq!(process.current_step, "debit");

    harness.drive_one_step().await; // debit succeeds -> advances to credit
    let process = harness.runtime.repo().get("payments", process_id).await.unwrap();
    assert_eq!(process.status, ProcessStatus::WaitingForReply);
    assert_eq!(process.current_step, "credit");

    harness.drive_one_step().await; // credit succeeds -> process completes
    let process = harness.runtime.repo().get("payments", process_id).await.unwrap();
    assert_eq!(process.status, ProcessStatus::Completed);

    let entries = harness.runtime.repo().audit_entries_reverse_sent(process_id).await.unwrap();
    assert_eq!(entries.len(), 2);
    // Reverse-sent order: credit (sent last) comes first.
    assert_eq!(entries[0].step_name, "credit");
    assert_eq!(entries[1].step_name, "debit");
    assert!(entries[0].received_at.is_some());
    assert!(entries[1].received_at.is_some());
}

/// S-Process-Compensation: a three-step saga where the second step fails
/// via a business-rule error triggers compensation of the first
/// (already-succeeded) step and lands the process on `CANCELED`.
#[tokio::test]
#[serial]
async fn business_rule_failure_on_second_step_compensates_the_first() {
    let mut registry = HandlerRegistry::new();
    registry.register("payments", "DebitAccount", Arc::new(AlwaysSucceeds)).unwrap();
    registry.register("payments", "CreditAccount", Arc::new(RejectsCredit)).unwrap();
    registry.register("payments", "RefundAccount", Arc::new(AlwaysSucceeds)).unwrap();
    let harness = Harness::new(registry, Arc::new(TransferManager)).await;

    let process_id = harness
        .runtime
        .start("payments", "transfer", None, json!({"amount": 250}))
        .await
        .unwrap();

    harness.drive_one_step().await; // debit succeeds -> advances to credit
    let process = harness.runtime.repo().get("payments", process_id).await.unwrap();
    assert_eq!(process.current_step, "credit");

    harness.drive_one_step().await; // credit fails (business rule) -> begins compensation
    let process = harness.runtime.repo().get("payments", process_id).await.unwrap();
    assert_eq!(process.status, ProcessStatus::Compensating);
    assert_eq!(process.current_step, "refund");
    assert!(process.compensating);

    harness.drive_one_step().await; // refund succeeds -> compensation drains to CANCELED
    let process = harness.runtime.repo().get("payments", process_id).await.unwrap();
    assert_eq!(process.status, ProcessStatus::Canceled);

    let entries = harness.runtime.repo().audit_entries_reverse_sent(process_id).await.unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].step_name, "refund");
    assert_eq!(entries[0].reply_outcome.as_deref(), Some("SUCCESS"));
    assert_eq!(entries[1].step_name, "credit");
    assert_eq!(entries[1].reply_outcome.as_deref(), Some("FAILED"));
    assert_eq!(entries[2].step_name, "debit");
    assert_eq!(entries[2].reply_outcome.as_deref(), Some("SUCCESS"));
}
