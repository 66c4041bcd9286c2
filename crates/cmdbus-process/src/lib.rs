//! # cmdbus-process
//!
//! Multi-step saga orchestration (spec.md §4.9-§4.10): the Process Manager
//! (C9) drives one process through a sequence of commands sent over the
//! command bus, folding replies back into process state and compensating
//! on cancellation or business-rule failure; the Process Reply Router (C10)
//! is the long-running consumer that feeds it.

pub mod manager;
pub mod models;
pub mod repository;
pub mod router;

pub use manager::{ProcessManager, ProcessManagerRegistry, ProcessManagerRuntime};
pub use models::{Process, ProcessAuditEntry, ProcessStatus};
pub use repository::ProcessRepository;
pub use router::ProcessReplyRouter;
