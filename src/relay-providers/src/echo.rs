//! Offline provider that answers every prompt with the prompt itself.

use async_trait::async_trait;

use relay_batch::{ModelProvider, ModelRequest, ModelResponse, ProviderError};

/// Deterministic provider for dry runs and tests.
///
/// Token counts are whitespace-separated word counts: the prompt (plus the
/// system prompt, if any) for input and the echoed text for output.
#[derive(Debug, Clone, Default)]
pub struct EchoProvider;

impl EchoProvider {
    pub fn new() -> Self {
        Self
    }
}

fn word_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

#[async_trait]
impl ModelProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn invoke(&self, request: &ModelRequest) -> Result<ModelResponse, ProviderError> {
        let system_words = request.system_prompt.as_deref().map_or(0, word_count);
        let words = word_count(&request.prompt);
        Ok(ModelResponse {
            text: request.prompt.clone(),
            input_tokens: words + system_words,
            output_tokens: words,
            response_id: None,
            model: Some(request.model.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_echoes_prompt() {
        let request = ModelRequest::new("say  hello world", "m1")
            .with_system_prompt(Some("be brief".to_string()));
        let response = EchoProvider::new().invoke(&request).await.unwrap();

        assert_eq!(response.text, "say  hello world");
        assert_eq!(response.input_tokens, 5);
        assert_eq!(response.output_tokens, 3);
        assert_eq!(response.model.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn test_empty_prompt() {
        let response = EchoProvider::new()
            .invoke(&ModelRequest::new("", "m1"))
            .await
            .unwrap();
        assert_eq!(response.text, "");
        assert_eq!(response.output_tokens, 0);
    }
}
