//! Model providers for Relay.
//!
//! Every provider implements [`relay_batch::ModelProvider`]; callers pick one
//! from `[provider]` configuration with [`build_provider`].

mod echo;
pub mod openai;

use std::sync::Arc;

use relay_batch::ModelProvider;
use relay_common::{ProviderKind, ProviderSettings};

pub use echo::EchoProvider;
pub use openai::OpenAiProvider;

/// Errors raised while constructing a provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderSetupError {
    #[error("API key not set; export {0} or choose the echo provider")]
    MissingApiKey(String),

    #[error("{0}")]
    Client(String),
}

pub type Result<T> = std::result::Result<T, ProviderSetupError>;

/// Construct the configured provider.
pub fn build_provider(settings: &ProviderSettings) -> Result<Arc<dyn ModelProvider>> {
    let provider: Arc<dyn ModelProvider> = match settings.kind {
        ProviderKind::Echo => Arc::new(EchoProvider::new()),
        ProviderKind::OpenAi => Arc::new(OpenAiProvider::from_settings(settings)?),
    };
    tracing::debug!(provider = provider.name(), "Provider ready");
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_build_echo() {
        let provider = build_provider(&ProviderSettings::default()).unwrap();
        assert_eq!(provider.name(), "echo");
    }
}
