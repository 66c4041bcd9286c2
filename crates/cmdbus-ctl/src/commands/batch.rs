//! Batch introspection commands (spec.md §4.3/§4.6).

use clap::Subcommand;
use cmdbus_core::CommandBus;
use cmdbus_shared::CmdBusResult;
use uuid::Uuid;

use crate::output;

#[derive(Debug, Subcommand)]
pub(crate) enum BatchCommands {
    /// List batches for a domain, most recently updated first.
    List {
        #[arg(long)]
        domain: String,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Show one batch's counters.
    Get {
        #[arg(long)]
        domain: String,
        batch_id: Uuid,
    },
    /// List the commands belonging to one batch.
    Commands {
        #[arg(long)]
        domain: String,
        batch_id: Uuid,
    },
}

pub(crate) async fn handle_batch_command(cmd: BatchCommands, bus: &CommandBus) -> CmdBusResult<()> {
    match cmd {
        BatchCommands::List { domain, limit, offset } => {
            let batches = bus.list_batches(&domain, limit, offset).await?;
            output::header(format!("{} batch(es) in '{domain}'", batches.len()));
            output::blank();
            for batch in batches {
                print_batch(&batch);
            }
        }
        BatchCommands::Get { domain, batch_id } => {
            let batches = bus.list_batches(&domain, i64::MAX, 0).await?;
            match batches.into_iter().find(|b| b.batch_id == batch_id) {
                Some(batch) => print_batch(&batch),
                None => return Err(cmdbus_shared::CmdBusError::batch_not_found(domain, batch_id)),
            }
        }
        BatchCommands::Commands { domain, batch_id } => {
            let commands = bus.list_batch_commands(&domain, batch_id).await?;
            output::header(format!("{} command(s) in batch {batch_id}", commands.len()));
            output::blank();
            for command in commands {
                output::item(format!("{} ({}) — {}", command.command_id, command.command_type, command.status));
            }
        }
    }
    Ok(())
}

fn print_batch(batch: &cmdbus_core::Batch) {
    output::item(format!("{} — {}", batch.batch_id, batch.status));
    if let Some(name) = &batch.name {
        output::label("  name", name);
    }
    output::label(
        "  progress",
        format!(
            "{completed} completed, {canceled} canceled, {tsq} in TSQ, {total} total",
            completed = batch.completed_count,
            canceled = batch.canceled_count,
            tsq = batch.in_troubleshooting_count,
            total = batch.total_count,
        ),
    );
    output::label("  updated_at", batch.updated_at);
    output::blank();
}
