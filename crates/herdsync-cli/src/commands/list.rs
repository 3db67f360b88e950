use herdsync_core::EntityKind;

use crate::commands::common::{
    format_record_lines, open_engine, record_to_list_item, Context, RecordListItem,
};
use crate::error::CliError;

pub async fn run_list(
    kind: EntityKind,
    limit: usize,
    unsynced: bool,
    as_json: bool,
    ctx: &Context,
) -> Result<(), CliError> {
    let engine = open_engine(ctx, false).await?;
    let mut records = if unsynced {
        engine.query(kind, |record| !record.synced).await?
    } else {
        engine.list(kind).await?
    };
    records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    records.truncate(limit);

    if as_json {
        let json_items = records
            .iter()
            .map(record_to_list_item)
            .collect::<Vec<RecordListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
    } else if records.is_empty() {
        println!("No {kind} records.");
    } else {
        for line in format_record_lines(&records) {
            println!("{line}");
        }
    }

    Ok(())
}

pub async fn run_show(
    kind: EntityKind,
    id: &str,
    as_json: bool,
    ctx: &Context,
) -> Result<(), CliError> {
    let engine = open_engine(ctx, false).await?;
    let record = engine
        .get(kind, id.trim())
        .await?
        .ok_or_else(|| CliError::RecordNotFound {
            kind: kind.to_string(),
            id: id.trim().to_string(),
        })?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&record_to_list_item(&record))?);
        return Ok(());
    }

    println!("{} {} ({})", record.kind, record.id, record.label());
    println!("synced: {}", if record.synced { "yes" } else { "no" });
    println!("{}", serde_json::to_string_pretty(&record.data)?);
    Ok(())
}
