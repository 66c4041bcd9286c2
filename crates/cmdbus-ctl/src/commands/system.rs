//! System-wide health check, collapsed to what a command bus deployment
//! actually has to report on: there's no separate orchestration service to
//! ping, so "system health" is database reachability plus, optionally, one
//! domain's queue depths.

use clap::Subcommand;
use cmdbus_pgmq::QueueClient;
use cmdbus_shared::wire::QueueNames;
use cmdbus_shared::CmdBusResult;
use sqlx::PgPool;

use crate::output;

#[derive(Debug, Subcommand)]
pub(crate) enum SystemCommands {
    /// Database connectivity, plus queue depths if `--domain` is given.
    Health {
        #[arg(long)]
        domain: Option<String>,
    },
}

pub(crate) async fn handle_system_command(cmd: SystemCommands, pool: &PgPool, queue: &QueueClient) -> CmdBusResult<()> {
    match cmd {
        SystemCommands::Health { domain } => {
            let db_healthy = sqlx::query("select 1").execute(pool).await.is_ok();
            output::status_icon(db_healthy, "database reachable");

            let Some(domain) = domain else {
                return Ok(());
            };

            output::blank();
            output::header(format!("queue depths for '{domain}'"));
            for (label, queue_name) in [
                ("commands", QueueNames::commands(&domain)),
                ("replies", QueueNames::replies(&domain)),
                ("process_replies", QueueNames::process_replies(&domain)),
            ] {
                match queue.queue_stats(&queue_name).await {
                    Ok(stats) => output::label(label, format!("{} pending", stats.queue_length)),
                    Err(err) => output::label(label, format!("unavailable ({err})")),
                }
            }
        }
    }
    Ok(())
}
