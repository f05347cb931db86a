//! Command dispatch.

use anyhow::Result;

use super::args::{Cli, Commands};
use crate::context::CliContext;

/// Route a parsed command to its handler.
pub async fn dispatch_command(cli: Cli, ctx: &CliContext) -> Result<()> {
    match cli.command {
        Commands::Batch(batch_cli) => batch_cli.run(ctx).await,
        Commands::Schedule(schedule_cli) => schedule_cli.run(ctx).await,
    }
}
