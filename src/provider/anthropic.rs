//! Anthropic Messages API provider.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::ProviderError;

use super::{send_json, CompletionProvider, CompletionRequest};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Provider backed by the Anthropic Messages API.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    /// Creates a provider for the public API endpoint.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Overrides the API base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn body(request: &CompletionRequest) -> Value {
        json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [
                { "role": "user", "content": request.prompt }
            ]
        })
    }

    /// Concatenates the text blocks of a Messages API response.
    fn parse(response: &Value) -> Result<String, ProviderError> {
        let blocks = response
            .get("content")
            .and_then(Value::as_array)
            .ok_or_else(|| ProviderError::Provider {
                status: None,
                message: "response has no content".to_string(),
                transient: false,
            })?;

        let text: String = blocks
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect();

        if text.trim().is_empty() {
            return Err(ProviderError::Provider {
                status: None,
                message: "response contained no text".to_string(),
                transient: false,
            });
        }

        if response.get("stop_reason").and_then(Value::as_str) == Some("max_tokens") {
            tracing::warn!(model = ?response.get("model"), "response truncated at max_tokens");
        }

        Ok(text)
    }
}

#[async_trait]
impl CompletionProvider for AnthropicProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        tracing::debug!(model = %request.model, prompt_len = request.prompt.len(), "anthropic request");

        let http = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&Self::body(request));

        let response = send_json(http, request.timeout).await?;
        Self::parse(&response)
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request() -> CompletionRequest {
        CompletionRequest {
            prompt: "Fix the bug".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 16000,
            temperature: 0.0,
            timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn body_has_single_user_message() {
        let body = AnthropicProvider::body(&request());
        assert_eq!(body["model"], "claude-sonnet-4-20250514");
        assert_eq!(body["max_tokens"], 16000);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "Fix the bug");
    }

    #[test]
    fn parse_joins_text_blocks() {
        let response = json!({
            "content": [
                {"type": "text", "text": "first "},
                {"type": "tool_use", "name": "x"},
                {"type": "text", "text": "second"}
            ],
            "stop_reason": "end_turn"
        });
        assert_eq!(AnthropicProvider::parse(&response).unwrap(), "first second");
    }

    #[test]
    fn parse_rejects_empty_content() {
        let response = json!({"content": []});
        let err = AnthropicProvider::parse(&response).unwrap_err();
        assert!(!err.is_retryable());

        let err = AnthropicProvider::parse(&json!({"id": "x"})).unwrap_err();
        assert!(matches!(err, ProviderError::Provider { .. }));
    }

    #[test]
    fn base_url_is_normalized() {
        let provider = AnthropicProvider::new("key").with_base_url("http://localhost:8080/");
        assert_eq!(provider.base_url, "http://localhost:8080");
        assert_eq!(provider.name(), "anthropic");
    }
}
