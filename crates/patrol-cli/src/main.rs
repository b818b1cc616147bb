//! Patrol CLI - shift-gated patrol sessions from the terminal
//!
//! Every action is mirrored on the device first and delivered to the session
//! store when it is reachable.

mod cli;
mod commands;
mod config_profiles;
mod error;


use chrono::Utc;
use clap::Parser;
use patrol_core::RestSessionStore;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, GlobalArgs};
use crate::commands::common::{CliController, Context};
use crate::commands::completions::run_completions;
use crate::commands::config::run_config;
use crate::commands::event::{run_checkpoint, run_log};
use crate::commands::session::{run_end, run_start};
use crate::commands::shift::run_shift;
use crate::commands::status::run_status;
use crate::commands::sync::{run_clear_synced, run_sync};
use crate::commands::watch::run_watch;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = "patrol=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let Cli { command, global } = Cli::parse();

    match command {
        Commands::Completions { shell, output } => run_completions(shell, output.as_deref())?,
        Commands::Config { command } => run_config(command, global.profile.as_deref())?,
        Commands::Shift => {
            let context = Context::resolve(&global)?;
            let store = context.store()?;
            run_shift(
                &store,
                context.guard_id()?,
                context.config.grace_minutes,
                Utc::now(),
            )
            .await;
        }
        Commands::Start { site, team } => {
            run_start(&open_controller(&global).await?, &site, team).await?;
        }
        Commands::Checkpoint { id, note } => {
            run_checkpoint(&open_controller(&global).await?, &id, note).await?;
        }
        Commands::Log { kind, payload } => {
            run_log(&open_controller(&global).await?, kind, payload.as_deref()).await?;
        }
        Commands::End => {
            run_end(&open_controller(&global).await?, false).await?;
        }
        Commands::Cancel => {
            run_end(&open_controller(&global).await?, true).await?;
        }
        Commands::Status { json } => {
            run_status(&open_controller(&global).await?, json).await?;
        }
        Commands::Sync => {
            run_sync(&open_controller(&global).await?).await?;
        }
        Commands::ClearSynced => {
            run_clear_synced(&open_controller(&global).await?).await?;
        }
        Commands::Watch => {
            let controller = open_controller(&global).await?;
            run_watch(&controller, interrupted()).await?;
        }
    }

    Ok(())
}

async fn open_controller(global: &GlobalArgs) -> Result<CliController<RestSessionStore>, CliError> {
    Context::resolve(global)?.system_controller().await
}

async fn interrupted() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!("Ctrl-C handler unavailable: {}", error);
        std::future::pending::<()>().await;
    }
}
