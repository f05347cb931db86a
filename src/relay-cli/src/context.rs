//! Shared state for command handlers: resolved config and data paths.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use relay_batch::{BatchStore, ModelProvider};
use relay_common::{AppDirs, ProviderKind, ProviderSettings, RelayConfig};
use relay_scheduler::ScheduleStore;

#[derive(Debug, Clone)]
pub struct CliContext {
    pub config: RelayConfig,
    pub dirs: AppDirs,
}

impl CliContext {
    /// Load configuration (explicit path, `RELAY_CONFIG`, or the default
    /// location) and resolve the data directory.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let config = RelayConfig::load(config_path).context("Failed to load configuration")?;
        let dirs = AppDirs::new().context("Failed to resolve the Relay data directory")?;
        Ok(Self { config, dirs })
    }

    pub fn new(config: RelayConfig, dirs: AppDirs) -> Self {
        Self { config, dirs }
    }

    pub async fn batch_store(&self) -> Result<BatchStore> {
        let store = BatchStore::new(self.dirs.batches_dir());
        store
            .init()
            .await
            .with_context(|| format!("Failed to create {}", store.base_dir().display()))?;
        Ok(store)
    }

    pub fn schedule_store(&self) -> ScheduleStore {
        ScheduleStore::new(self.dirs.schedules_file())
    }

    /// Provider settings with an optional per-command kind override.
    pub fn provider_settings(&self, kind: Option<ProviderKind>) -> ProviderSettings {
        let mut settings = self.config.provider.clone();
        if let Some(kind) = kind {
            settings.kind = kind;
        }
        settings
    }

    pub fn provider(&self, kind: Option<ProviderKind>) -> Result<Arc<dyn ModelProvider>> {
        let settings = self.provider_settings(kind);
        relay_providers::build_provider(&settings)
            .with_context(|| format!("Failed to set up the {} provider", settings.kind))
    }

    /// Model from the flag, else the configured default.
    pub fn model(&self, flag: Option<String>) -> String {
        flag.unwrap_or_else(|| self.config.provider.model.clone())
    }
}
