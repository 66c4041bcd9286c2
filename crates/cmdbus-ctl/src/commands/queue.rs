//! Queue introspection commands: backlog depth and age, plus a plain
//! connectivity check (spec.md §9's worker health component, surfaced here
//! for operators rather than a running worker process).

use clap::Subcommand;
use cmdbus_pgmq::QueueClient;
use cmdbus_shared::wire::QueueNames;
use cmdbus_shared::{CmdBusError, CmdBusResult};

use crate::output;

#[derive(Debug, Subcommand)]
pub(crate) enum QueueCommands {
    /// Backlog depth and oldest/newest message age for one queue.
    Stats {
        #[arg(long)]
        domain: String,
        /// One of `commands`, `replies`, `process_replies`.
        #[arg(long, default_value = "commands")]
        queue: String,
    },
    /// Confirm the queue client can reach Postgres.
    Health,
}

fn queue_name(domain: &str, kind: &str) -> CmdBusResult<String> {
    match kind {
        "commands" => Ok(QueueNames::commands(domain)),
        "replies" => Ok(QueueNames::replies(domain)),
        "process_replies" => Ok(QueueNames::process_replies(domain)),
        other => Err(CmdBusError::invalid_operation(format!(
            "invalid queue '{other}'. Valid: commands, replies, process_replies"
        ))),
    }
}

pub(crate) async fn handle_queue_command(cmd: QueueCommands, queue: &QueueClient) -> CmdBusResult<()> {
    match cmd {
        QueueCommands::Stats { domain, queue: kind } => {
            let queue_name = queue_name(&domain, &kind)?;
            let stats = queue
                .queue_stats(&queue_name)
                .await
                .map_err(|e| CmdBusError::queue(e.to_string()))?;
            output::header(format!("queue '{queue_name}'"));
            output::label("length", stats.queue_length);
            output::label(
                "oldest message age (s)",
                stats.oldest_msg_age_seconds.map_or("n/a".to_string(), |v| v.to_string()),
            );
            output::label(
                "newest message age (s)",
                stats.newest_msg_age_seconds.map_or("n/a".to_string(), |v| v.to_string()),
            );
        }
        QueueCommands::Health => {
            let healthy = queue.health_check().await.map_err(|e| CmdBusError::queue(e.to_string()))?;
            output::status_icon(healthy, "queue client reachable");
        }
    }
    Ok(())
}
