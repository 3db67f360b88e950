use crate::cli::QueueCommands;
use crate::commands::common::{format_queue_lines, open_engine, Context};
use crate::error::CliError;

pub async fn run_queue(command: Option<QueueCommands>, ctx: &Context) -> Result<(), CliError> {
    match command.unwrap_or(QueueCommands::List { json: false }) {
        QueueCommands::List { json } => run_queue_list(json, ctx).await,
        QueueCommands::Retry { id, all } => run_queue_retry(id, all, ctx).await,
        QueueCommands::Discard { id } => run_queue_discard(id, ctx).await,
    }
}

async fn run_queue_list(as_json: bool, ctx: &Context) -> Result<(), CliError> {
    let engine = open_engine(ctx, false).await?;
    let items = engine.list_queue().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else if items.is_empty() {
        println!("Mutation queue is empty.");
    } else {
        for line in format_queue_lines(&items, ctx.config.max_retries) {
            println!("{line}");
        }
    }
    Ok(())
}

async fn run_queue_retry(id: Option<i64>, all: bool, ctx: &Context) -> Result<(), CliError> {
    let engine = open_engine(ctx, false).await?;
    if all {
        let reset = engine.retry_all().await?;
        println!("Reset {reset} queued items");
        return Ok(());
    }

    let id = id.ok_or(CliError::MissingQueueTarget)?;
    engine.retry_item(id).await?;
    println!("Queued item #{id} will be retried on the next sync");
    Ok(())
}

async fn run_queue_discard(id: i64, ctx: &Context) -> Result<(), CliError> {
    let engine = open_engine(ctx, false).await?;
    let item = engine.discard_item(id).await?;
    println!(
        "Discarded {} of {} {}",
        item.operation, item.entity_kind, item.entity_id
    );
    Ok(())
}
