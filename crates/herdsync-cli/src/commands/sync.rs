use herdsync_core::EntityKind;

use crate::commands::common::{format_sync_timestamp, open_engine, Context};
use crate::error::CliError;

pub async fn run_sync(as_json: bool, ctx: &Context) -> Result<(), CliError> {
    let engine = open_engine(ctx, true).await?;
    let report = engine.manual_sync().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "Sync completed: {} pushed, {} conflicts, {} failed, {} skipped",
        report.pushed, report.conflicts, report.failed, report.skipped
    );
    if let Some(error) = report.last_error {
        println!("Last error: {error}");
    }
    Ok(())
}

pub async fn run_pull(kind: EntityKind, ctx: &Context) -> Result<(), CliError> {
    let engine = open_engine(ctx, true).await?;
    let pulled = engine.force_pull(kind).await?;
    println!("Pulled {pulled} {kind} records");
    Ok(())
}

pub async fn run_status(as_json: bool, ctx: &Context) -> Result<(), CliError> {
    let engine = open_engine(ctx, false).await?;
    let status = engine.status();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Pending changes:  {}", status.pending_count);
    println!("Open conflicts:   {}", status.conflict_count);
    println!("Need attention:   {}", status.attention_count);
    println!(
        "Last sync:        {}",
        status
            .last_sync_time
            .map_or_else(|| "never".to_string(), format_sync_timestamp)
    );
    Ok(())
}
