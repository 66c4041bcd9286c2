//! Troubleshooting queue operator commands (spec.md §4.8): parse args, call
//! the domain object, print results with [`crate::output`], propagate
//! errors via `?`.

use clap::Subcommand;
use cmdbus_core::{CommandBus, TroubleshootingQueue};
use cmdbus_shared::CmdBusResult;
use uuid::Uuid;

use crate::output;

#[derive(Debug, Subcommand)]
pub(crate) enum TsqCommands {
    /// List commands currently parked in the troubleshooting queue.
    List {
        #[arg(long)]
        domain: String,
        #[arg(long)]
        command_type: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Re-send the archived command as a fresh attempt.
    Retry {
        #[arg(long)]
        domain: String,
        command_id: Uuid,
        #[arg(long)]
        operator: String,
    },
    /// Mark a command canceled without retrying it.
    Cancel {
        #[arg(long)]
        domain: String,
        command_id: Uuid,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        operator: String,
    },
    /// Mark a command completed by hand, optionally supplying a result.
    Complete {
        #[arg(long)]
        domain: String,
        command_id: Uuid,
        #[arg(long)]
        operator: String,
        /// JSON value sent back to the original caller as `result`.
        #[arg(long)]
        result: Option<String>,
    },
}

pub(crate) async fn handle_tsq_command(cmd: TsqCommands, bus: &CommandBus) -> CmdBusResult<()> {
    let tsq = TroubleshootingQueue::new(bus);

    match cmd {
        TsqCommands::List {
            domain,
            command_type,
            limit,
            offset,
        } => {
            let rows = tsq.list(&domain, command_type.as_deref(), limit, offset).await?;
            output::header(format!("{} command(s) in troubleshooting queue", rows.len()));
            output::blank();
            for row in rows {
                output::item(format!("{} ({})", row.command_id, row.command_type));
                output::label("  attempts", format!("{}/{}", row.attempts, row.max_attempts));
                if let Some(code) = &row.last_error_code {
                    output::label("  last error", format!("{code}: {}", row.last_error_message.as_deref().unwrap_or("")));
                }
                output::label("  updated_at", row.updated_at);
            }
        }
        TsqCommands::Retry { domain, command_id, operator } => {
            tsq.operator_retry(&domain, command_id, &operator).await?;
            output::success(format!("{command_id} re-sent for a fresh attempt"));
        }
        TsqCommands::Cancel {
            domain,
            command_id,
            reason,
            operator,
        } => {
            tsq.operator_cancel(&domain, command_id, &reason, &operator).await?;
            output::success(format!("{command_id} canceled"));
        }
        TsqCommands::Complete {
            domain,
            command_id,
            operator,
            result,
        } => {
            let result = result
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .map_err(|e: serde_json::Error| cmdbus_shared::CmdBusError::invalid_operation(format!("--result is not valid JSON: {e}")))?;
            tsq.operator_complete(&domain, command_id, result, &operator).await?;
            output::success(format!("{command_id} marked completed"));
        }
    }
    Ok(())
}
