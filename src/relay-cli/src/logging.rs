//! Tracing setup for the binary.

use std::fs::File;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::cli::LogLevel;

/// Environment variable that sets the stderr log level.
pub const RELAY_LOG_LEVEL_ENV: &str = "RELAY_LOG_LEVEL";

/// File written by `--debug`, relative to the working directory.
pub const DEBUG_LOG_FILE: &str = "relay-debug.log";

/// Pick the stderr log level. First match wins: `--trace`, `--verbose`,
/// `--log-level`, `RELAY_LOG_LEVEL`, then the config file (default warn).
/// Unrecognized env or config values fall through.
pub fn resolve_log_level(
    trace: bool,
    verbose: bool,
    env_level: Option<&str>,
    config_level: Option<&str>,
    flag: Option<LogLevel>,
) -> LogLevel {
    if trace {
        return LogLevel::Trace;
    }
    if verbose {
        return LogLevel::Debug;
    }
    flag.or_else(|| env_level.and_then(LogLevel::from_str_loose))
        .or_else(|| config_level.and_then(LogLevel::from_str_loose))
        .unwrap_or_default()
}

/// Log to stderr, filtered to relay's own crates unless `RUST_LOG` says otherwise.
pub fn init_stderr_logging(level: LogLevel) {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::new(filter_directives(level)),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn filter_directives(level: LogLevel) -> String {
    let level = level.as_filter_str();
    format!(
        "warn,relay_cli={level},relay_batch={level},relay_common={level},\
         relay_providers={level},relay_scheduler={level}"
    )
}

/// Keeps the non-blocking writer alive; dropping it flushes the log file.
pub struct DebugLogGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Write every trace-level event to `./relay-debug.log`.
pub fn setup_debug_file_logging() -> Result<DebugLogGuard> {
    let path = std::env::current_dir()?.join(DEBUG_LOG_FILE);
    let file = File::create(&path).with_context(|| {
        format!(
            "Failed to create {}. Check write permissions.",
            path.display()
        )
    })?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(EnvFilter::new("trace"))
        .with(file_layer)
        .init();

    eprintln!("Debug mode enabled: logging to {}", path.display());
    Ok(DebugLogGuard { _guard: guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_take_precedence() {
        assert_eq!(
            resolve_log_level(true, true, Some("error"), None, None),
            LogLevel::Trace
        );
        assert_eq!(
            resolve_log_level(false, true, Some("error"), Some("info"), Some(LogLevel::Error)),
            LogLevel::Debug
        );
    }

    #[test]
    fn test_explicit_level_beats_env_and_config() {
        assert_eq!(
            resolve_log_level(false, false, Some("info"), Some("error"), Some(LogLevel::Trace)),
            LogLevel::Trace
        );
        assert_eq!(
            resolve_log_level(false, false, None, Some("error"), Some(LogLevel::Debug)),
            LogLevel::Debug
        );
    }

    #[test]
    fn test_env_then_config() {
        assert_eq!(
            resolve_log_level(false, false, Some("info"), Some("error"), None),
            LogLevel::Info
        );
        assert_eq!(
            resolve_log_level(false, false, Some("loud"), Some("error"), None),
            LogLevel::Error
        );
        assert_eq!(resolve_log_level(false, false, None, None, None), LogLevel::Warn);
    }

    #[test]
    fn test_filter_covers_workspace_crates() {
        let directives = filter_directives(LogLevel::Info);
        assert!(directives.starts_with("warn,"));
        assert!(directives.contains("relay_batch=info"));
        assert!(directives.contains("relay_scheduler=info"));
    }
}
