//! Relay CLI library.
//!
//! Command definitions and handlers for the `relay` binary.

pub mod batch_cmd;
pub mod cli;
pub mod context;
pub mod logging;
pub mod schedule_cmd;
pub mod styled_output;

pub use batch_cmd::BatchCli;
pub use cli::{Cli, Commands, LogLevel, dispatch_command};
pub use context::CliContext;
pub use schedule_cmd::ScheduleCli;
