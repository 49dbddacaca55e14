//! OpenAI Chat Completions provider.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::ProviderError;

use super::{send_json, CompletionProvider, CompletionRequest};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Provider backed by the OpenAI Chat Completions API.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
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

    fn parse(response: &Value) -> Result<String, ProviderError> {
        let choice = response
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first());

        let text = choice
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(ProviderError::Provider {
                status: None,
                message: "response contained no message content".to_string(),
                transient: false,
            });
        }

        if choice.and_then(|c| c.get("finish_reason")).and_then(Value::as_str) == Some("length") {
            tracing::warn!("response truncated at max_tokens");
        }

        Ok(text.to_string())
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        tracing::debug!(model = %request.model, prompt_len = request.prompt.len(), "openai request");

        let http = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&Self::body(request));

        let response = send_json(http, request.timeout).await?;
        Self::parse(&response)
    }

    fn name(&self) -> &str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn body_carries_limits() {
        let request = CompletionRequest {
            prompt: "p".to_string(),
            model: "gpt-4o".to_string(),
            max_tokens: 8000,
            temperature: 0.0,
            timeout: Duration::from_secs(10),
        };
        let body = OpenAiProvider::body(&request);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["max_tokens"], 8000);
        assert_eq!(body["messages"][0]["content"], "p");
    }

    #[test]
    fn parse_reads_first_choice() {
        let response = json!({
            "choices": [
                {"message": {"role": "assistant", "content": "answer"}, "finish_reason": "stop"}
            ]
        });
        assert_eq!(OpenAiProvider::parse(&response).unwrap(), "answer");
    }

    #[test]
    fn parse_rejects_missing_choices() {
        assert!(OpenAiProvider::parse(&json!({"choices": []})).is_err());
        assert!(OpenAiProvider::parse(&json!({})).is_err());
    }
}
