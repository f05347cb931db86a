//! Help output styling.

use clap::builder::styling::{AnsiColor, Effects, Styles};

pub fn get_styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Yellow.on_default())
        .error(AnsiColor::Red.on_default() | Effects::BOLD)
        .valid(AnsiColor::Cyan.on_default())
        .invalid(AnsiColor::Yellow.on_default())
}

/// After-help section with quick start, environment and paths.
pub const AFTER_HELP: &str = color_print::cstr!(
    r#"<cyan,bold>QUICK START</>
    <green,bold>relay batch run</> <dim>prompts.csv --template "Summarize {text}"</>
    <green,bold>relay batch status</> <dim>ID</>            Per-batch counts (ID prefix accepted)
    <green,bold>relay batch resume</> <dim>ID</>            Continue an interrupted batch
    <green,bold>relay schedule add</> <dim>"daily digest" --every 1d</>

<cyan,bold>ENVIRONMENT VARIABLES</>
    <yellow>RELAY_HOME</>           Data directory (default: ~/.relay)
    <yellow>RELAY_CONFIG</>         Config file (default: $RELAY_HOME/config.toml)
    <yellow>RELAY_LOG_LEVEL</>      Log verbosity (error, warn, info, debug, trace)
    <yellow>OPENAI_API_KEY</>       API key for the openai provider
    <yellow>NO_COLOR</>             Disable colored output

<cyan,bold>PATHS</>
    <dim>Config</>      ~/.relay/config.toml
    <dim>Batches</>     ~/.relay/batches/ID/
    <dim>Schedules</>   ~/.relay/schedules.json"#
);
