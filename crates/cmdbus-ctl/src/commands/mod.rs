//! Command handlers for `cmdbus-ctl`, one module per command group.

pub(crate) mod batch;
pub(crate) mod queue;
pub(crate) mod system;
pub(crate) mod tsq;

pub(crate) use batch::handle_batch_command;
pub(crate) use queue::handle_queue_command;
pub(crate) use system::handle_system_command;
pub(crate) use tsq::handle_tsq_command;
