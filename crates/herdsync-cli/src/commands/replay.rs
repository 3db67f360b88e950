use herdsync_core::replay::{Dispatch, ReplayLayer, ReplayRequest};
use herdsync_core::sync::Connectivity;
use serde_json::Value;

use crate::cli::ReplayCommands;
use crate::commands::common::{
    format_sync_timestamp, open_database, replay_entry_to_item, resolve_target_url, Context,
    ReplayListItem,
};
use crate::error::CliError;

fn open_layer(ctx: &Context) -> Result<ReplayLayer<reqwest::Client>, CliError> {
    let db = open_database(&ctx.db_path)?;
    let client = reqwest::Client::builder()
        .timeout(ctx.config.request_timeout())
        .build()
        .map_err(|error| CliError::InvalidRequest(format!("failed to build HTTP client: {error}")))?;
    Ok(ReplayLayer::new(
        client,
        db,
        Connectivity::new(true),
        ctx.config.replay_policy(),
    ))
}

pub async fn run_replay(command: Option<ReplayCommands>, ctx: &Context) -> Result<(), CliError> {
    match command.unwrap_or(ReplayCommands::List { json: false }) {
        ReplayCommands::List { json } => run_replay_list(json, ctx).await,
        ReplayCommands::Run => run_replay_now(ctx).await,
        ReplayCommands::Send {
            method,
            target,
            body,
        } => run_replay_send(&method, &target, body.as_deref(), ctx).await,
    }
}

async fn run_replay_list(as_json: bool, ctx: &Context) -> Result<(), CliError> {
    let entries = open_layer(ctx)?.pending().await?;

    if as_json {
        let json_items = entries
            .iter()
            .map(replay_entry_to_item)
            .collect::<Vec<ReplayListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No stored requests.");
        return Ok(());
    }
    for entry in entries {
        println!(
            "#{:<5} {} {} (stored {}, {} attempts)",
            entry.id,
            entry.request.method,
            entry.request.url,
            format_sync_timestamp(entry.enqueued_at),
            entry.attempts
        );
    }
    Ok(())
}

async fn run_replay_now(ctx: &Context) -> Result<(), CliError> {
    let report = open_layer(ctx)?.replay().await?;
    println!(
        "Replayed: {} delivered, {} rejected, {} dropped, {} expired, {} remaining",
        report.delivered, report.rejected, report.dropped, report.expired, report.remaining
    );
    if report.stalled {
        println!("Server still unreachable; remaining requests kept");
    }
    Ok(())
}

async fn run_replay_send(
    method: &str,
    target: &str,
    body: Option<&str>,
    ctx: &Context,
) -> Result<(), CliError> {
    let url = resolve_target_url(&ctx.config.api_base_url, target)?;
    let mut request = ReplayRequest::new(method.trim().to_ascii_uppercase(), url);
    if let Some(token) = &ctx.config.auth_token {
        request = request.header("authorization", format!("Bearer {token}"));
    }
    if let Some(raw) = body {
        let value: Value = serde_json::from_str(raw)?;
        request = request.json(&value)?;
    }

    match open_layer(ctx)?.send(request).await? {
        Dispatch::Delivered(response) => {
            println!("HTTP {}", response.status);
            if !response.body.is_empty() {
                println!("{}", String::from_utf8_lossy(&response.body));
            }
        }
        Dispatch::Queued { entry_id } => {
            println!("Server unreachable; stored as #{entry_id} for replay");
        }
    }
    Ok(())
}
