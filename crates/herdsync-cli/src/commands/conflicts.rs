use herdsync_core::models::{ConflictArtifact, ConflictChoice};

use crate::commands::common::{format_conflict_lines, open_engine, Context};
use crate::error::CliError;

pub async fn run_conflicts(
    include_resolved: bool,
    limit: usize,
    as_json: bool,
    ctx: &Context,
) -> Result<(), CliError> {
    let engine = open_engine(ctx, false).await?;
    let conflicts = engine.list_conflicts(include_resolved, limit).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

/// Resolution is local; the re-queued update goes out on the next `sync`
pub async fn run_resolve(
    id: Option<i64>,
    all: bool,
    keep: ConflictChoice,
    ctx: &Context,
) -> Result<(), CliError> {
    let engine = open_engine(ctx, false).await?;

    if all {
        let resolved = engine.resolve_all(keep).await?;
        println!("Resolved {resolved} conflicts keeping {keep}");
        return Ok(());
    }

    let id = id.ok_or(CliError::MissingConflictTarget)?;
    let conflict: ConflictArtifact = engine.resolve_conflict(id, keep).await?;
    println!(
        "Resolved conflict #{} for {} {} keeping {keep}",
        conflict.id, conflict.entity_kind, conflict.entity_id
    );
    Ok(())
}
