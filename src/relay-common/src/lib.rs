//! Directories, configuration and HTTP plumbing shared across Relay crates.

pub mod config;
pub mod dirs;
pub mod http_client;

pub use config::{
    BatchSettings, ConfigError, LoggingSettings, ProviderKind, ProviderSettings, RELAY_CONFIG_ENV,
    RelayConfig, resolve_config_path,
};
pub use dirs::{AppDirs, RELAY_HOME_ENV, get_app_dirs};
pub use http_client::{USER_AGENT, create_client_with_timeout, create_default_client};
