use herdsync_core::EntityKind;

use crate::commands::common::{open_engine, Context};
use crate::error::CliError;

pub async fn run_delete(kind: EntityKind, id: &str, ctx: &Context) -> Result<(), CliError> {
    let id = id.trim();
    let engine = open_engine(ctx, false).await?;
    engine.delete(kind, id).await?;

    println!("{id}");
    Ok(())
}
