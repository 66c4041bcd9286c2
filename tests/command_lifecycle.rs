//! End-to-end coverage of the command/batch lifecycle against a live
//! Postgres database with the `pgmq` extension installed (spec.md §8's
//! seed scenarios). Run with
//! `cargo test --features test-db --test command_lifecycle`.

#![cfg(feature = "test-db")]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cmdbus_core::{
    Command, CommandBus, CommandHandler, CommandStatus, HandlerContext, HandlerError,
    HandlerRegistry, TroubleshootingQueue,
};
use cmdbus_pgmq::QueueClient;
use cmdbus_shared::config::BusConfig;
use cmdbus_shared::wire::QueueNames;
use cmdbus_worker::retry::RetryPolicy;
use cmdbus_worker::WorkerCore;
use serde_json::json;
use serial_test::serial;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

async fn test_bus() -> (Arc<CommandBus>, sqlx::PgPool) {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for test-db tests");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to test database");
    let queue = QueueClient::new(pool.clone())
        .await
        .expect("failed to build queue client");
    (Arc::new(CommandBus::new(pool.clone(), queue, 3, 1000)), pool)
}

/// A `RetryPolicy` with a zero-second backoff schedule so transient-retry
/// scenarios don't actually sleep in the test process.
fn fast_retry_policy() -> RetryPolicy {
    RetryPolicy::new(BusConfig {
        default_max_attempts: 3,
        backoff_schedule_seconds: vec![0, 0, 0],
    })
}

fn worker_core(domain: &str, bus: Arc<CommandBus>, registry: Arc<HandlerRegistry>) -> WorkerCore {
    WorkerCore {
        domain: domain.to_string(),
        bus,
        registry,
        retry_policy: fast_retry_policy(),
        metrics: Arc::new(Default::default()),
    }
}

async fn receive_one(bus: &CommandBus, domain: &str) -> cmdbus_pgmq::QueueMessage<Command> {
    let queue_name = QueueNames::commands(domain);
    bus.queue().ensure_queue(&queue_name).await.unwrap();
    let mut msgs = bus
        .queue()
        .read::<Command>(&queue_name, std::time::Duration::from_secs(30), 1)
        .await
        .unwrap();
    assert_eq!(msgs.len(), 1, "expected exactly one message on {queue_name}");
    msgs.remove(0)
}

struct Echo;

#[async_trait]
impl CommandHandler for Echo {
    async fn handle(&self, command: &Command, _ctx: &HandlerContext) -> Result<serde_json::Value, HandlerError> {
        Ok(command.data.clone())
    }
}

/// S-Success: a handler that always succeeds reaches `COMPLETED`, the
/// queue empties, and no reply is sent (no `reply_to`).
#[tokio::test]
#[serial]
async fn echo_command_completes_and_leaves_no_trace_in_the_queue() {
    let (bus, _pool) = test_bus().await;
    let domain = "test";
    let mut registry = HandlerRegistry::new();
    registry.register(domain, "Echo", Arc::new(Echo)).unwrap();
    let registry = Arc::new(registry);

    let command_id = Uuid::new_v4();
    bus.send(domain, "Echo", command_id, json!({"n": 1}), None, None, None, None)
        .await
        .unwrap();

    let msg = receive_one(&bus, domain).await;
    let core = worker_core(domain, bus.clone(), registry);
    core.process_one(&QueueNames::commands(domain), msg).await;

    let metadata = bus.get_command(domain, command_id).await.unwrap();
    assert_eq!(metadata.status, CommandStatus::Completed);
    assert_eq!(metadata.attempts, 1);

    let trail = bus.get_audit_trail(command_id).await.unwrap();
    let event_types: Vec<_> = trail.iter().map(|e| e.event_type).collect();
    assert_eq!(
        event_types,
        vec![
            cmdbus_core::AuditEventType::Sent,
            cmdbus_core::AuditEventType::Received,
            cmdbus_core::AuditEventType::Completed,
        ]
    );

    let queue_name = QueueNames::commands(domain);
    let remaining = bus
        .queue()
        .read::<Command>(&queue_name, std::time::Duration::from_secs(1), 10)
        .await
        .unwrap();
    assert!(remaining.is_empty());
}

struct FlakyOnce {
    attempt: AtomicU32,
}

#[async_trait]
impl CommandHandler for FlakyOnce {
    async fn handle(&self, command: &Command, _ctx: &HandlerContext) -> Result<serde_json::Value, HandlerError> {
        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst);
        if attempt == 0 {
            Err(HandlerError::transient("X", "x"))
        } else {
            Ok(command.data.clone())
        }
    }
}

/// S-Transient-Recovers: attempt 1 fails transiently, attempt 2 succeeds;
/// the command ends `COMPLETED` with `attempts = 2`.
#[tokio::test]
#[serial]
async fn transient_failure_recovers_on_second_attempt() {
    let (bus, _pool) = test_bus().await;
    let domain = "test_flaky";
    let mut registry = HandlerRegistry::new();
    registry.register(domain, "Flaky", Arc::new(FlakyOnce { attempt: AtomicU32::new(0) })).unwrap();
    let registry = Arc::new(registry);
    let core = worker_core(domain, bus.clone(), registry);
    let queue_name = QueueNames::commands(domain);

    let command_id = Uuid::new_v4();
    bus.send(domain, "Flaky", command_id, json!({"n": 2}), None, None, None, None)
        .await
        .unwrap();

    // Attempt 1: fails transiently, deferred with a zero-second backoff.
    let msg = receive_one(&bus, domain).await;
    core.process_one(&queue_name, msg).await;
    let metadata = bus.get_command(domain, command_id).await.unwrap();
    assert_eq!(metadata.status, CommandStatus::InProgress);
    assert_eq!(metadata.attempts, 1);

    // Attempt 2: the deferred message is visible again (zero-second delay)
    // and the handler now succeeds.
    let msg = receive_one(&bus, domain).await;
    core.process_one(&queue_name, msg).await;
    let metadata = bus.get_command(domain, command_id).await.unwrap();
    assert_eq!(metadata.status, CommandStatus::Completed);
    assert_eq!(metadata.attempts, 2);
}

struct AlwaysTransient;

#[async_trait]
impl CommandHandler for AlwaysTransient {
    async fn handle(&self, _command: &Command, _ctx: &HandlerContext) -> Result<serde_json::Value, HandlerError> {
        Err(HandlerError::transient("X", "x"))
    }
}

/// S-Transient-Exhausted: a handler that always fails transiently escalates
/// to the troubleshooting queue once `max_attempts` is reached, with the
/// payload preserved in the archive.
#[tokio::test]
#[serial]
async fn transient_failure_exhausted_escalates_to_tsq() {
    let (bus, _pool) = test_bus().await;
    let domain = "test_exhausted";
    let mut registry = HandlerRegistry::new();
    registry.register(domain, "AlwaysTransient", Arc::new(AlwaysTransient)).unwrap();
    let registry = Arc::new(registry);
    let core = worker_core(domain, bus.clone(), registry);
    let queue_name = QueueNames::commands(domain);

    let command_id = Uuid::new_v4();
    bus.send(domain, "AlwaysTransient", command_id, json!({}), None, None, Some(3), None)
        .await
        .unwrap();

    for _ in 0..3 {
        let msg = receive_one(&bus, domain).await;
        core.process_one(&queue_name, msg).await;
    }

    let metadata = bus.get_command(domain, command_id).await.unwrap();
    assert_eq!(metadata.status, CommandStatus::InTroubleshootingQueue);
    assert_eq!(metadata.attempts, 3);

    let trail = bus.get_audit_trail(command_id).await.unwrap();
    assert_eq!(trail.last().unwrap().event_type, cmdbus_core::AuditEventType::MovedToTsq);

    let archived = bus
        .queue()
        .get_from_archive::<serde_json::Value>(&queue_name, command_id)
        .await
        .unwrap();
    assert!(archived.is_some());
}

struct AlwaysPermanent;

#[async_trait]
impl CommandHandler for AlwaysPermanent {
    async fn handle(&self, _command: &Command, _ctx: &HandlerContext) -> Result<serde_json::Value, HandlerError> {
        Err(HandlerError::permanent("BAD", "x"))
    }
}

/// S-Permanent-To-TSQ: a `PermanentCommandError` on the first attempt moves
/// straight to TSQ, no retry, and (since `reply_to` is set) a `FAILED`
/// reply is emitted.
#[tokio::test]
#[serial]
async fn permanent_failure_moves_to_tsq_on_first_attempt_and_replies() {
    let (bus, _pool) = test_bus().await;
    let domain = "test_permanent";
    let mut registry = HandlerRegistry::new();
    registry.register(domain, "AlwaysPermanent", Arc::new(AlwaysPermanent)).unwrap();
    let registry = Arc::new(registry);
    let core = worker_core(domain, bus.clone(), registry);
    let queue_name = QueueNames::commands(domain);
    let reply_queue = QueueNames::replies(domain);
    bus.queue().ensure_queue(&reply_queue).await.unwrap();

    let command_id = Uuid::new_v4();
    bus.send(domain, "AlwaysPermanent", command_id, json!({}), None, Some(reply_queue.clone()), None, None)
        .await
        .unwrap();

    let msg = receive_one(&bus, domain).await;
    core.process_one(&queue_name, msg).await;

    let metadata = bus.get_command(domain, command_id).await.unwrap();
    assert_eq!(metadata.status, CommandStatus::InTroubleshootingQueue);
    assert_eq!(metadata.attempts, 1);

    let replies = bus
        .queue()
        .read::<cmdbus_shared::wire::ReplyEnvelope>(&reply_queue, std::time::Duration::from_secs(5), 1)
        .await
        .unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].payload.outcome, cmdbus_shared::wire::ReplyOutcome::Failed);
}

struct AlwaysBusinessRule;

#[async_trait]
impl CommandHandler for AlwaysBusinessRule {
    async fn handle(&self, _command: &Command, _ctx: &HandlerContext) -> Result<serde_json::Value, HandlerError> {
        Err(HandlerError::business_rule("NO_ACCT", "no such account"))
    }
}

/// S-Business-Rule-Fail: terminal `FAILED`, the queue message is deleted
/// (never archived), and the reply carries the handler's own error code.
#[tokio::test]
#[serial]
async fn business_rule_failure_is_terminal_and_bypasses_tsq() {
    let (bus, _pool) = test_bus().await;
    let domain = "test_business_rule";
    let mut registry = HandlerRegistry::new();
    registry.register(domain, "AlwaysBusinessRule", Arc::new(AlwaysBusinessRule)).unwrap();
    let registry = Arc::new(registry);
    let core = worker_core(domain, bus.clone(), registry);
    let queue_name = QueueNames::commands(domain);
    let reply_queue = QueueNames::replies(domain);
    bus.queue().ensure_queue(&reply_queue).await.unwrap();

    let command_id = Uuid::new_v4();
    bus.send(domain, "AlwaysBusinessRule", command_id, json!({}), None, Some(reply_queue.clone()), None, None)
        .await
        .unwrap();

    let msg = receive_one(&bus, domain).await;
    core.process_one(&queue_name, msg).await;

    let metadata = bus.get_command(domain, command_id).await.unwrap();
    assert_eq!(metadata.status, CommandStatus::Failed);

    let archived = bus
        .queue()
        .get_from_archive::<serde_json::Value>(&queue_name, command_id)
        .await
        .unwrap();
    assert!(archived.is_none(), "business-rule failures must never be archived to TSQ");

    let replies = bus
        .queue()
        .read::<cmdbus_shared::wire::ReplyEnvelope>(&reply_queue, std::time::Duration::from_secs(5), 1)
        .await
        .unwrap();
    assert_eq!(replies[0].payload.error_code.as_deref(), Some("NO_ACCT"));
}

/// S-Operator-Retry: a TSQ'd command, retried by an operator, gets a fresh
/// `msg_id`, resets to `PENDING`/`attempts = 0`, and subsequently processes
/// normally.
#[tokio::test]
#[serial]
async fn operator_retry_resets_attempts_and_reprocesses() {
    let (bus, _pool) = test_bus().await;
    let domain = "test_operator_retry";
    let mut registry = HandlerRegistry::new();
    registry.register(domain, "AlwaysPermanent", Arc::new(AlwaysPermanent)).unwrap();
    let registry = Arc::new(registry);
    let core = worker_core(domain, bus.clone(), registry);
    let queue_name = QueueNames::commands(domain);

    let command_id = Uuid::new_v4();
    bus.send(domain, "AlwaysPermanent", command_id, json!({}), None, None, None, None)
        .await
        .unwrap();
    let msg = receive_one(&bus, domain).await;
    core.process_one(&queue_name, msg).await;

    let metadata = bus.get_command(domain, command_id).await.unwrap();
    assert_eq!(metadata.status, CommandStatus::InTroubleshootingQueue);

    let tsq = TroubleshootingQueue::new(&bus);
    tsq.operator_retry(domain, command_id, "alice").await.unwrap();

    let metadata = bus.get_command(domain, command_id).await.unwrap();
    assert_eq!(metadata.status, CommandStatus::Pending);
    assert_eq!(metadata.attempts, 0);

    let trail = bus.get_audit_trail(command_id).await.unwrap();
    assert_eq!(trail.last().unwrap().event_type, cmdbus_core::AuditEventType::OperatorRetry);

    // The retried message is receivable again; it will still fail
    // permanently under this handler, ending back in TSQ.
    let msg = receive_one(&bus, domain).await;
    core.process_one(&queue_name, msg).await;
    let metadata = bus.get_command(domain, command_id).await.unwrap();
    assert_eq!(metadata.status, CommandStatus::InTroubleshootingQueue);
    assert_eq!(metadata.attempts, 1);
}

struct MixedOutcome;

#[async_trait]
impl CommandHandler for MixedOutcome {
    async fn handle(&self, command: &Command, _ctx: &HandlerContext) -> Result<serde_json::Value, HandlerError> {
        let fail = command.data.get("fail").and_then(|v| v.as_bool()).unwrap_or(false);
        if fail {
            Err(HandlerError::permanent("BAD", "x"))
        } else {
            Ok(json!({"ok": true}))
        }
    }
}

/// S-Batch-Complete-With-Failures: a batch of three commands, two succeed
/// and one is permanently escalated to TSQ; the batch reports
/// `COMPLETED_WITH_FAILURES` with `completed=2, in_tsq=1`, and once the
/// operator cancels the TSQ'd one, `completed=2, canceled=1, in_tsq=0` with
/// the `on_complete` callback firing exactly once.
#[tokio::test]
#[serial]
async fn batch_completes_with_failures_and_operator_cancel_settles_counters() {
    let (bus, _pool) = test_bus().await;
    let domain = "test_batch";
    let mut registry = HandlerRegistry::new();
    registry.register(domain, "Mixed", Arc::new(MixedOutcome)).unwrap();
    let registry = Arc::new(registry);
    let core = worker_core(domain, bus.clone(), registry);
    let queue_name = QueueNames::commands(domain);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Uuid>();
    let requests = vec![
        cmdbus_core::CommandRequest {
            domain: domain.to_string(),
            command_type: "Mixed".to_string(),
            command_id: Uuid::new_v4(),
            data: json!({"fail": false}),
            correlation_id: None,
            reply_to: None,
            max_attempts: None,
        },
        cmdbus_core::CommandRequest {
            domain: domain.to_string(),
            command_type: "Mixed".to_string(),
            command_id: Uuid::new_v4(),
            data: json!({"fail": false}),
            correlation_id: None,
            reply_to: None,
            max_attempts: None,
        },
        cmdbus_core::CommandRequest {
            domain: domain.to_string(),
            command_type: "Mixed".to_string(),
            command_id: Uuid::new_v4(),
            data: json!({"fail": true}),
            correlation_id: None,
            reply_to: None,
            max_attempts: None,
        },
    ];

    let (batch_id, results) = bus
        .create_batch(domain, requests, None, Some("mixed-batch".into()), None, Some(Box::new(move |id| {
            let _ = tx.send(id);
        })))
        .await
        .unwrap();
    assert_eq!(results.len(), 3);

    for _ in 0..3 {
        let msg = receive_one(&bus, domain).await;
        core.process_one(&queue_name, msg).await;
    }

    let batches = bus.list_batches(domain, 10, 0).await.unwrap();
    let batch = batches.into_iter().find(|b| b.batch_id == batch_id).unwrap();
    assert_eq!(batch.completed_count, 2);
    assert_eq!(batch.in_troubleshooting_count, 1);
    assert_eq!(batch.canceled_count, 0);
    assert_eq!(batch.status, cmdbus_core::BatchStatus::CompletedWithFailures);

    let tsq_commands = bus.list_batch_commands(domain, batch_id).await.unwrap();
    let failed = tsq_commands
        .into_iter()
        .find(|c| c.status == CommandStatus::InTroubleshootingQueue)
        .unwrap();

    let tsq = TroubleshootingQueue::new(&bus);
    let batch_complete = tsq.operator_cancel(domain, failed.command_id, "giving up", "alice").await.unwrap();
    assert!(batch_complete);

    let batches = bus.list_batches(domain, 10, 0).await.unwrap();
    let batch = batches.into_iter().find(|b| b.batch_id == batch_id).unwrap();
    assert_eq!(batch.completed_count, 2);
    assert_eq!(batch.canceled_count, 1);
    assert_eq!(batch.in_troubleshooting_count, 0);
    assert_eq!(batch.status, cmdbus_core::BatchStatus::CompletedWithFailures);

    bus.fire_batch_complete_callback(batch_id).await;
    let received = rx.try_recv();
    assert_eq!(received, Ok(batch_id));
    assert_eq!(rx.try_recv(), Err(tokio::sync::mpsc::error::TryRecvError::Empty));
}
