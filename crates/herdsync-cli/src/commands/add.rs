use herdsync_core::EntityKind;

use crate::commands::common::{open_engine, parse_fields, Context};
use crate::error::CliError;

pub async fn run_add(
    kind: EntityKind,
    fields: &[String],
    json: Option<&str>,
    ctx: &Context,
) -> Result<(), CliError> {
    let payload = parse_fields(fields, json)?;

    let engine = open_engine(ctx, false).await?;
    let record = engine.create(kind, payload).await?;

    println!("{}", record.id);
    Ok(())
}
