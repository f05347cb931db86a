//! Top-level command-line arguments.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use super::styles::{AFTER_HELP, get_styles};
use crate::batch_cmd::BatchCli;
use crate::schedule_cmd::ScheduleCli;

/// Log verbosity level for CLI output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    /// Only show errors
    Error,
    /// Show warnings and errors (default)
    #[default]
    Warn,
    Info,
    Debug,
    /// Show all messages including trace-level details
    Trace,
}

impl LogLevel {
    /// Convert to tracing filter string.
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Parse from string (case-insensitive).
    pub fn from_str_loose(s: &str) -> Option<LogLevel> {
        match s.trim().to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }
}

/// Relay - batch and scheduled prompts for language models
#[derive(Debug, Parser)]
#[command(name = "relay")]
#[command(author, version, about, long_about = None)]
#[command(styles = get_styles(), after_help = AFTER_HELP)]
pub struct Cli {
    /// Enable verbose output (same as --log-level debug)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Enable trace-level logging
    #[arg(long, global = true)]
    pub trace: bool,

    /// Log level for stderr output
    #[arg(long, global = true, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Write trace-level logs to ./relay-debug.log
    #[arg(long, global = true)]
    pub debug: bool,

    /// Config file (default: $RELAY_CONFIG or $RELAY_HOME/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run prompts from a file concurrently with retry and checkpointing
    #[command(visible_alias = "b")]
    Batch(BatchCli),

    /// Manage prompts that run on a schedule
    #[command(visible_alias = "sched")]
    Schedule(ScheduleCli),
}
