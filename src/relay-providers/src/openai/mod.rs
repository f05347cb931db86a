//! OpenAI-compatible chat completions provider.
//!
//! Works against `api.openai.com` and any server speaking the same
//! `POST {base_url}/chat/completions` protocol.

mod models;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use relay_batch::{ModelProvider, ModelRequest, ModelResponse, ProviderError, ProviderErrorKind};
use relay_common::{ProviderSettings, create_client_with_timeout};

use crate::{ProviderSetupError, Result};

pub use models::{ChatMessage, ChatRequest, ChatResponse, Usage};
use models::ApiErrorBody;

/// Client for an OpenAI-compatible endpoint.
#[derive(Clone)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl OpenAiProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = create_client_with_timeout(timeout).map_err(ProviderSetupError::Client)?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }

    /// Build from `[provider]` settings, reading the key from the configured
    /// environment variable.
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self> {
        let api_key = std::env::var(&settings.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ProviderSetupError::MissingApiKey(settings.api_key_env.clone()))?;
        Self::new(
            settings.base_url.clone(),
            api_key,
            Duration::from_secs(settings.request_timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    /// Send a chat completion request.
    pub async fn chat_completion(
        &self,
        request: &ChatRequest,
    ) -> std::result::Result<ChatResponse, ProviderError> {
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        response.json::<ChatResponse>().await.map_err(|e| {
            ProviderError::new(
                ProviderErrorKind::Other,
                format!("invalid response body: {e}"),
            )
        })
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn invoke(
        &self,
        request: &ModelRequest,
    ) -> std::result::Result<ModelResponse, ProviderError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system_prompt {
            messages.push(ChatMessage::system(system.clone()));
        }
        messages.push(ChatMessage::user(request.prompt.clone()));

        let chat = self
            .chat_completion(&ChatRequest::new(request.model.clone(), messages))
            .await?;
        let text = chat.content().map(str::to_string).ok_or_else(|| {
            ProviderError::new(
                ProviderErrorKind::Other,
                "response contained no message content",
            )
        })?;
        let usage = chat.usage.unwrap_or_default();
        debug!(
            model = %request.model,
            input_tokens = usage.prompt_tokens,
            output_tokens = usage.completion_tokens,
            "Chat completion finished"
        );

        Ok(ModelResponse {
            text,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            response_id: chat.id,
            model: chat.model,
        })
    }
}

/// Classify a non-2xx status.
fn status_error(status: StatusCode, body: &str) -> ProviderError {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| {
            if body.is_empty() {
                status.to_string()
            } else {
                format!("{status}: {body}")
            }
        });
    let kind = match status.as_u16() {
        429 => ProviderErrorKind::RateLimit,
        401 | 403 => ProviderErrorKind::Authentication,
        408 => ProviderErrorKind::Timeout,
        400..=499 => ProviderErrorKind::Validation,
        500..=599 => ProviderErrorKind::Server,
        _ => ProviderErrorKind::Other,
    };
    ProviderError::new(kind, message)
}

fn transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::timeout(e.to_string())
    } else {
        ProviderError::network(e.to_string())
    }
}
