//! LLM completion providers.
//!
//! Every backend answers a single prompt with text. HTTP backends share the
//! status classification in this module so retry behaviour is identical
//! across providers.

mod anthropic;
mod claude_cli;
mod openai;

pub use anthropic::AnthropicProvider;
pub use claude_cli::ClaudeCliProvider;
pub use openai::OpenAiProvider;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{ProviderError, Result};

/// One completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Full prompt text.
    pub prompt: String,
    /// Model identifier.
    pub model: String,
    /// Output token limit.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Request timeout.
    pub timeout: Duration,
}

impl CompletionRequest {
    /// Builds a request using the configured model and limits.
    pub fn from_config(prompt: impl Into<String>, config: &ProviderConfig) -> Self {
        Self {
            prompt: prompt.into(),
            model: config.model(),
            max_tokens: config.max_tokens(),
            temperature: config.temperature,
            timeout: config.timeout(),
        }
    }
}

/// Trait for completion backends.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Sends the prompt and returns the model's text answer.
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<String, ProviderError>;

    /// Returns the name of this provider.
    fn name(&self) -> &str;
}

/// Builds the provider selected by the configuration.
///
/// Fails with a configuration error when a required API key is missing.
pub fn from_config(config: &ProviderConfig) -> Result<Arc<dyn CompletionProvider>> {
    let provider: Arc<dyn CompletionProvider> = match config.kind {
        ProviderKind::Anthropic => {
            let key = config.api_key()?.unwrap_or_default();
            let mut provider = AnthropicProvider::new(key);
            if let Some(url) = &config.base_url {
                provider = provider.with_base_url(url.clone());
            }
            Arc::new(provider)
        }
        ProviderKind::Openai => {
            let key = config.api_key()?.unwrap_or_default();
            let mut provider = OpenAiProvider::new(key);
            if let Some(url) = &config.base_url {
                provider = provider.with_base_url(url.clone());
            }
            Arc::new(provider)
        }
        ProviderKind::ClaudeCli => Arc::new(ClaudeCliProvider::new()),
    };

    tracing::debug!(provider = provider.name(), model = %config.model(), "provider ready");
    Ok(provider)
}

/// Maps a non-success HTTP status to a provider error.
///
/// 429 is a rate limit, 408 a timeout, 5xx and Anthropic's 529 (overloaded)
/// are transient; every other 4xx is permanent.
pub(crate) fn classify_status(
    status: u16,
    retry_after: Option<Duration>,
    timeout: Duration,
    message: String,
) -> ProviderError {
    match status {
        429 => ProviderError::RateLimited { retry_after },
        408 => ProviderError::Timeout(timeout),
        500..=599 => ProviderError::Provider {
            status: Some(status),
            message,
            transient: true,
        },
        _ => ProviderError::Provider {
            status: Some(status),
            message,
            transient: false,
        },
    }
}

/// Parses a `retry-after` header given in seconds.
pub(crate) fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    let secs: f64 = value?.trim().parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

/// Maps a reqwest failure that happened before a status was received.
pub(crate) fn transport_error(err: reqwest::Error, timeout: Duration) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(timeout)
    } else {
        ProviderError::Transport(err.to_string())
    }
}

/// Sends a prepared request and returns the parsed JSON body of a success.
pub(crate) async fn send_json(
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> std::result::Result<serde_json::Value, ProviderError> {
    let response = request
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| transport_error(e, timeout))?;

    let status = response.status();
    if !status.is_success() {
        let retry_after = parse_retry_after(
            response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok()),
        );
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(
            status.as_u16(),
            retry_after,
            timeout,
            error_message(&body),
        ));
    }

    response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| ProviderError::Transport(format!("invalid response body: {}", e)))
}

/// Extracts `error.message` from an error body, falling back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|json| {
            json.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(500).collect())
}
