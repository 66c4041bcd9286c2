//! # cmdbus-core
//!
//! The coordination engine: Command Repository (C2), Batch Repository
//! (C3), Audit Logger (C4), Handler Registry (C5), Command Bus (C6), and
//! the Troubleshooting Queue (C8). Everything here persists through
//! `sqlx::PgPool` and enqueues through `cmdbus_pgmq::QueueClient` — no
//! other crate touches the `command`/`batch`/`audit` tables directly.

pub mod audit;
pub mod bus;
pub mod models;
pub mod registry;
pub mod repository;
pub mod tsq;

pub use bus::{CommandBus, CommandRequest};
pub use models::{AuditEvent, AuditEventType, Batch, BatchStatus, CommandMetadata, CommandStatus};
pub use registry::{Command, CommandHandler, HandlerContext, HandlerError, HandlerRegistry, VisibilityExtender};
pub use tsq::TroubleshootingQueue;
