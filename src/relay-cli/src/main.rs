//! Relay CLI - main entry point.
//!
//! - `relay batch` runs prompt files through the batch engine
//! - `relay schedule` manages and runs scheduled prompts

use anyhow::Result;
use clap::Parser;

use relay_cli::cli::{Cli, dispatch_command};
use relay_cli::context::CliContext;
use relay_cli::logging::{
    RELAY_LOG_LEVEL_ENV, init_stderr_logging, resolve_log_level, setup_debug_file_logging,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let ctx = CliContext::load(cli.config.as_deref())?;

    let _debug_guard = if cli.debug {
        Some(setup_debug_file_logging()?)
    } else {
        let env_level = std::env::var(RELAY_LOG_LEVEL_ENV).ok();
        let level = resolve_log_level(
            cli.trace,
            cli.verbose,
            env_level.as_deref(),
            ctx.config.logging.level.as_deref(),
            cli.log_level,
        );
        init_stderr_logging(level);
        None
    };

    tracing::debug!(home = %ctx.dirs.home.display(), "Relay starting");
    dispatch_command(cli, &ctx).await
}
