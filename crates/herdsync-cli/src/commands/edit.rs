use herdsync_core::EntityKind;

use crate::commands::common::{open_engine, parse_fields, Context};
use crate::error::CliError;

pub async fn run_edit(
    kind: EntityKind,
    id: &str,
    fields: &[String],
    json: Option<&str>,
    ctx: &Context,
) -> Result<(), CliError> {
    let patch = parse_fields(fields, json)?;

    let engine = open_engine(ctx, false).await?;
    let record = engine.update(kind, id.trim(), patch).await?;

    println!("{}", record.id);
    Ok(())
}
