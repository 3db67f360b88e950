use crate::commands::common::{format_history_lines, open_engine, Context};
use crate::error::CliError;

pub async fn run_history(
    limit: usize,
    offset: usize,
    as_json: bool,
    ctx: &Context,
) -> Result<(), CliError> {
    let engine = open_engine(ctx, false).await?;
    let entries = engine.list_history(limit, offset).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else if entries.is_empty() {
        println!("No sync history.");
    } else {
        for line in format_history_lines(&entries) {
            println!("{line}");
        }
    }
    Ok(())
}
