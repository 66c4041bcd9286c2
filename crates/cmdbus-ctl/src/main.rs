//! `cmdbus-ctl`: operator CLI for the command bus. Wraps the troubleshooting
//! queue's three operator operations (spec.md §4.8) plus batch and queue
//! introspection in a `clap` derive front end, with one module per command
//! group, each dispatching to a `handle_*_command(cmd, ...)` function.
//!
//! This binary talks directly to Postgres rather than through an HTTP API
//! client: the command bus has no orchestration service of its own to front
//! it, so the CLI opens its own pool and constructs a `CommandBus` in-process
//! for the duration of the invocation.

mod commands;
mod output;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use cmdbus_core::CommandBus;
use cmdbus_pgmq::QueueClient;
use cmdbus_shared::config::CmdBusConfig;
use sqlx::postgres::PgPoolOptions;

use commands::{handle_batch_command, handle_queue_command, handle_system_command, handle_tsq_command};

pub(crate) use commands::batch::BatchCommands;
pub(crate) use commands::queue::QueueCommands;
pub(crate) use commands::system::SystemCommands;
pub(crate) use commands::tsq::TsqCommands;

#[derive(Debug, Parser)]
#[command(name = "cmdbus-ctl", version, about = "Operator CLI for the command bus", styles = output::clap_styles())]
struct Cli {
    /// Overrides `database.url` from the loaded config.
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Troubleshooting queue: list and resolve escalated commands.
    Tsq {
        #[command(subcommand)]
        cmd: TsqCommands,
    },
    /// Batch introspection.
    Batch {
        #[command(subcommand)]
        cmd: BatchCommands,
    },
    /// Queue introspection.
    Queue {
        #[command(subcommand)]
        cmd: QueueCommands,
    },
    /// Overall system health.
    System {
        #[command(subcommand)]
        cmd: SystemCommands,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = CmdBusConfig::load().unwrap_or_else(|err| {
        output::warning(format!("failed to load config, using defaults: {err}"));
        CmdBusConfig::default()
    });
    if let Some(database_url) = cli.database_url {
        config.database.url = database_url;
    }

    cmdbus_shared::config::init_tracing(&config.tracing);

    let pool = match PgPoolOptions::new()
        .min_connections(config.database.min_pool_size)
        .max_connections(config.database.max_pool_size)
        .connect(&config.database.url)
        .await
    {
        Ok(pool) => pool,
        Err(err) => {
            output::error(format!("failed to connect to {}: {err}", config.database.url));
            return ExitCode::FAILURE;
        }
    };

    let queue = match QueueClient::new(pool.clone()).await {
        Ok(queue) => queue,
        Err(err) => {
            output::error(format!("failed to initialize queue client: {err}"));
            return ExitCode::FAILURE;
        }
    };

    let bus = CommandBus::new(
        pool.clone(),
        queue.clone(),
        config.bus.default_max_attempts as i32,
        config.batch.default_chunk_size,
    );

    let result = match cli.command {
        Command::Tsq { cmd } => handle_tsq_command(cmd, &bus).await,
        Command::Batch { cmd } => handle_batch_command(cmd, &bus).await,
        Command::Queue { cmd } => handle_queue_command(cmd, &queue).await,
        Command::System { cmd } => handle_system_command(cmd, &pool, &queue).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            output::error(err.to_string());
            ExitCode::FAILURE
        }
    }
}
