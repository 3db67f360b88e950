use crate::commands::common::{open_engine, Context};
use crate::error::CliError;

pub async fn run_logout(force: bool, ctx: &Context) -> Result<(), CliError> {
    let engine = open_engine(ctx, false).await?;
    let pending = engine.list_queue().await?.len();
    if pending > 0 && !force {
        return Err(CliError::PendingChanges(pending));
    }

    engine.clear_user_data().await?;
    println!("Local data cleared");
    Ok(())
}
