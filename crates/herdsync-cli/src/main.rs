//! herdsync CLI - operate a local herd record store from the terminal
//!
//! Edits are written locally and queued; `herdsync sync` pushes them.

mod cli;
mod commands;
mod error;

#[cfg(test)]
mod tests;

use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::add::run_add;
use crate::commands::common::Context;
use crate::commands::conflicts::{run_conflicts, run_resolve};
use crate::commands::delete::run_delete;
use crate::commands::edit::run_edit;
use crate::commands::history::run_history;
use crate::commands::list::{run_list, run_show};
use crate::commands::logout::run_logout;
use crate::commands::queue::run_queue;
use crate::commands::replay::run_replay;
use crate::commands::sync::{run_pull, run_status, run_sync};
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

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("herdsync=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ctx = Context::new(cli.db_path, cli.config.as_deref())?;

    match cli.command {
        Commands::Add { kind, fields, json } => {
            run_add(kind, &fields, json.as_deref(), &ctx).await?;
        }
        Commands::Edit {
            kind,
            id,
            fields,
            json,
        } => run_edit(kind, &id, &fields, json.as_deref(), &ctx).await?,
        Commands::Delete { kind, id } => run_delete(kind, &id, &ctx).await?,
        Commands::List {
            kind,
            limit,
            unsynced,
            json,
        } => run_list(kind, limit, unsynced, json, &ctx).await?,
        Commands::Show { kind, id, json } => run_show(kind, &id, json, &ctx).await?,
        Commands::Sync { json } => run_sync(json, &ctx).await?,
        Commands::Pull { kind } => run_pull(kind, &ctx).await?,
        Commands::Status { json } => run_status(json, &ctx).await?,
        Commands::Conflicts { all, limit, json } => run_conflicts(all, limit, json, &ctx).await?,
        Commands::Resolve { id, keep, all } => run_resolve(id, all, keep, &ctx).await?,
        Commands::History {
            limit,
            offset,
            json,
        } => run_history(limit, offset, json, &ctx).await?,
        Commands::Queue { command } => run_queue(command, &ctx).await?,
        Commands::Replay { command } => run_replay(command, &ctx).await?,
        Commands::Logout { force } => run_logout(force, &ctx).await?,
    }

    Ok(())
}
