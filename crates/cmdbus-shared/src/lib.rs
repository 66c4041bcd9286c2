//! # cmdbus-shared
//!
//! Ambient stack shared by every crate in this workspace: configuration,
//! the error taxonomy, circuit-breaker resilience, and the wire formats
//! that cross a queue boundary. Nothing in this crate talks to Postgres or
//! PGMQ directly — that lives in `cmdbus-pgmq` and `cmdbus-core`.

pub mod config;
pub mod error;
pub mod resilience;
pub mod wire;

pub use config::CmdBusConfig;
pub use error::{CmdBusError, CmdBusResult};
