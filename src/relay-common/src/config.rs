//! `config.toml` loading.
//!
//! The file is optional: a missing file yields [`RelayConfig::default`].
//! Lookup order is an explicit path, then `RELAY_CONFIG`, then
//! `<RELAY_HOME>/config.toml`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::dirs::AppDirs;

/// Environment variable naming a config file.
pub const RELAY_CONFIG_ENV: &str = "RELAY_CONFIG";

/// Errors from locating or parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}:\n{message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Home directory not found; set RELAY_HOME")]
    NoHome,
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Root of `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    pub batch: BatchSettings,
    pub provider: ProviderSettings,
    pub logging: LoggingSettings,
}

/// `[batch]` defaults for new batch runs. CLI flags override these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchSettings {
    pub concurrency: usize,
    /// Calls per minute; unset means unthrottled.
    pub rate_limit_per_minute: Option<u32>,
    pub max_attempts: u32,
    pub task_timeout_secs: u64,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    pub flush_every: usize,
    pub flush_interval_ms: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            rate_limit_per_minute: None,
            max_attempts: 3,
            task_timeout_secs: 120,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: 0.1,
            flush_every: 16,
            flush_interval_ms: 2_000,
        }
    }
}

/// Which model-call collaborator to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Offline provider that answers with the prompt.
    #[default]
    Echo,
    /// OpenAI-compatible chat completions endpoint.
    OpenAi,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Echo => write!(f, "echo"),
            Self::OpenAi => write!(f, "openai"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "echo" => Ok(Self::Echo),
            "openai" => Ok(Self::OpenAi),
            other => Err(ConfigError::Invalid(format!(
                "unknown provider '{other}' (expected echo or openai)"
            ))),
        }
    }
}

/// `[provider]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub model: String,
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub request_timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Echo,
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            request_timeout_secs: 120,
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    /// An `EnvFilter` directive such as `info` or `relay_batch=debug`.
    pub level: Option<String>,
}

impl RelayConfig {
    /// Resolve the config path and load it.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = resolve_config_path(explicit)?;
        Self::load_from(&path)
    }

    /// Load a specific file. Missing files yield defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        debug!(path = %path.display(), "Loading config file");
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: format_toml_error(&e, &content),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let batch = &self.batch;
        if batch.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "batch.concurrency must be at least 1".to_string(),
            ));
        }
        if batch.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "batch.max_attempts must be at least 1".to_string(),
            ));
        }
        if batch.rate_limit_per_minute == Some(0) {
            return Err(ConfigError::Invalid(
                "batch.rate_limit_per_minute must be at least 1 when set".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&batch.jitter) {
            return Err(ConfigError::Invalid(
                "batch.jitter must be between 0.0 and 1.0".to_string(),
            ));
        }
        if batch.flush_every == 0 {
            return Err(ConfigError::Invalid(
                "batch.flush_every must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where the config file is read from: `explicit`, else `RELAY_CONFIG`, else
/// the home directory's `config.toml`.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(RELAY_CONFIG_ENV)
        && !path.is_empty()
    {
        debug!(path = %path, "Using RELAY_CONFIG");
        return Ok(PathBuf::from(path));
    }
    AppDirs::new()
        .map(|dirs| dirs.config_file())
        .ok_or(ConfigError::NoHome)
}

/// Render a TOML error with its line and a caret under the column.
fn format_toml_error(e: &toml::de::Error, content: &str) -> String {
    let mut msg = String::new();
    if let Some(span) = e.span() {
        let before = &content[..span.start.min(content.len())];
        let line_num = before.matches('\n').count() + 1;
        let col = before.len() - before.rfind('\n').map(|i| i + 1).unwrap_or(0) + 1;
        if let Some(line) = content.lines().nth(line_num - 1) {
            let gutter = line_num.to_string();
            msg.push_str(&format!("  {gutter}: {line}\n"));
            msg.push_str(&format!(
                "  {}  {}^\n",
                " ".repeat(gutter.len()),
                " ".repeat(col - 1)
            ));
        }
    }
    msg.push_str(&format!("  {}", e.message()));
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, RelayConfig::default());
        assert_eq!(config.batch.concurrency, 4);
        assert_eq!(config.provider.kind, ProviderKind::Echo);
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let (_dir, path) = write_config(
            r#"
[batch]
concurrency = 8
rate_limit_per_minute = 120

[provider]
kind = "openai"
base_url = "http://localhost:8080/v1"

[logging]
level = "relay_batch=debug"
"#,
        );
        let config = RelayConfig::load_from(&path).unwrap();
        assert_eq!(config.batch.concurrency, 8);
        assert_eq!(config.batch.rate_limit_per_minute, Some(120));
        assert_eq!(config.batch.max_attempts, 3);
        assert_eq!(config.provider.kind, ProviderKind::OpenAi);
        assert_eq!(config.provider.api_key_env, "OPENAI_API_KEY");
        assert_eq!(config.logging.level.as_deref(), Some("relay_batch=debug"));
    }

    #[test]
    fn test_parse_error_points_at_line() {
        let (_dir, path) = write_config("[batch]\nconcurrency = \"many\"\n");
        let err = RelayConfig::load_from(&path).unwrap_err();
        let ConfigError::Parse { message, .. } = err else {
            panic!("expected parse error, got {err:?}");
        };
        assert!(message.contains("2: concurrency"), "{message}");
        assert!(message.contains('^'));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let (_dir, path) = write_config("[batch]\nconcurency = 2\n");
        assert!(matches!(
            RelayConfig::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let (_dir, path) = write_config("[batch]\nconcurrency = 0\n");
        assert!(matches!(
            RelayConfig::load_from(&path),
            Err(ConfigError::Invalid(_))
        ));

        let (_dir, path) = write_config("[batch]\njitter = 1.5\n");
        assert!(matches!(
            RelayConfig::load_from(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_provider_kind_from_str() {
        assert_eq!("OpenAI".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert_eq!("echo".parse::<ProviderKind>().unwrap(), ProviderKind::Echo);
        assert!("claude".parse::<ProviderKind>().is_err());
    }

    #[test]
    #[serial]
    fn test_resolution_order() {
        let dir = tempfile::tempdir().unwrap();
        let from_env = dir.path().join("env.toml");
        let explicit = dir.path().join("explicit.toml");

        // SAFETY: tests touching the environment are serialized.
        unsafe {
            std::env::set_var(RELAY_CONFIG_ENV, &from_env);
            std::env::set_var(crate::dirs::RELAY_HOME_ENV, dir.path());
        }
        assert_eq!(resolve_config_path(Some(&explicit)).unwrap(), explicit);
        assert_eq!(resolve_config_path(None).unwrap(), from_env);

        unsafe {
            std::env::remove_var(RELAY_CONFIG_ENV);
        }
        assert_eq!(
            resolve_config_path(None).unwrap(),
            dir.path().join("config.toml")
        );

        unsafe {
            std::env::remove_var(crate::dirs::RELAY_HOME_ENV);
        }
    }
}
