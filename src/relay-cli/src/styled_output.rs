//! Styled status messages for the terminal.
//!
//! Messages go to stderr so command output on stdout stays pipeable. Colors
//! are dropped when `NO_COLOR` is set or the stream is not a terminal.

use std::io::IsTerminal;

/// Check if colors should be disabled based on NO_COLOR env var.
fn colors_disabled() -> bool {
    std::env::var("NO_COLOR")
        .map(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(false)
}

fn use_colors(stderr: bool) -> bool {
    if colors_disabled() {
        return false;
    }
    if stderr {
        std::io::stderr().is_terminal()
    } else {
        std::io::stdout().is_terminal()
    }
}

const RESET: &str = "\x1b[0m";

/// Message type for styled output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Success,
    Error,
    Warning,
    Info,
    /// Neutral/dimmed message
    Dim,
}

impl MessageType {
    fn icon(self) -> &'static str {
        match self {
            MessageType::Success => "[OK]",
            MessageType::Error => "[ERROR]",
            MessageType::Warning => "[WARN]",
            MessageType::Info => "[INFO]",
            MessageType::Dim => "-",
        }
    }

    fn color(self) -> &'static str {
        match self {
            MessageType::Success => "\x1b[38;2;0;245;212m",
            MessageType::Error => "\x1b[38;2;255;107;107m",
            MessageType::Warning => "\x1b[38;2;255;200;87m",
            MessageType::Info => "\x1b[38;2;72;202;228m",
            MessageType::Dim => "\x1b[38;2;130;154;177m",
        }
    }
}

fn format_with(msg_type: MessageType, message: &str, colors: bool) -> String {
    if colors {
        format!("{}{} {}{}", msg_type.color(), msg_type.icon(), message, RESET)
    } else {
        format!("{} {}", msg_type.icon(), message)
    }
}

fn print_styled(msg_type: MessageType, message: &str) {
    eprintln!("{}", format_with(msg_type, message, use_colors(true)));
}

pub fn print_success(message: &str) {
    print_styled(MessageType::Success, message);
}

pub fn print_error(message: &str) {
    print_styled(MessageType::Error, message);
}

pub fn print_warning(message: &str) {
    print_styled(MessageType::Warning, message);
}

pub fn print_info(message: &str) {
    print_styled(MessageType::Info, message);
}

pub fn print_dim(message: &str) {
    print_styled(MessageType::Dim, message);
}

/// Return a colored label for inline use on stdout.
pub fn styled_label(msg_type: MessageType, label: &str) -> String {
    if use_colors(false) {
        format!("{}{}{}", msg_type.color(), label, RESET)
    } else {
        label.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_plain_format() {
        assert_eq!(
            format_with(MessageType::Warning, "careful", false),
            "[WARN] careful"
        );
        let colored = format_with(MessageType::Success, "done", true);
        assert!(colored.starts_with("\x1b["));
        assert!(colored.ends_with(RESET));
    }

    #[test]
    #[serial]
    fn test_colors_disabled() {
        // SAFETY: These tests run serially and we restore env vars immediately
        unsafe { std::env::set_var("NO_COLOR", "1") };
        assert!(colors_disabled());
        assert_eq!(styled_label(MessageType::Error, "failed"), "failed");

        unsafe { std::env::set_var("NO_COLOR", "false") };
        assert!(!colors_disabled());

        unsafe { std::env::remove_var("NO_COLOR") };
        assert!(!colors_disabled());
    }
}
