//! Claude CLI provider.
//!
//! Runs `claude --print` as a one-shot subprocess. The prompt is written to
//! stdin since knowledge-base prompts can exceed the argument size limit.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::ProviderError;

use super::{CompletionProvider, CompletionRequest};

/// Provider that shells out to the Claude CLI.
pub struct ClaudeCliProvider {
    /// Path to the claude CLI binary.
    cli_path: String,
}

impl Default for ClaudeCliProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaudeCliProvider {
    /// Creates a provider using the default `claude` command.
    pub fn new() -> Self {
        Self {
            cli_path: "claude".to_string(),
        }
    }

    /// Creates a provider with a custom CLI path.
    pub fn with_cli_path(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
        }
    }

    /// Builds the command arguments. The prompt itself goes to stdin.
    fn build_args(&self, request: &CompletionRequest) -> Vec<String> {
        vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "text".to_string(),
            "--model".to_string(),
            request.model.clone(),
        ]
    }

    /// Maps a failed CLI invocation onto the provider error taxonomy.
    fn classify_failure(code: Option<i32>, stderr: &str) -> ProviderError {
        let lower = stderr.to_lowercase();
        if lower.contains("rate limit") || lower.contains("429") {
            return ProviderError::RateLimited { retry_after: None };
        }
        ProviderError::Provider {
            status: code.and_then(|c| u16::try_from(c).ok()),
            message: stderr.trim().chars().take(500).collect(),
            transient: lower.contains("overloaded") || lower.contains("529"),
        }
    }
}

#[async_trait]
impl CompletionProvider for ClaudeCliProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        let args = self.build_args(request);

        tracing::debug!(cli = %self.cli_path, model = %request.model, "spawning Claude CLI");

        let mut child = Command::new(&self.cli_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::Provider {
                status: None,
                message: format!("failed to spawn {}: {}", self.cli_path, e),
                transient: false,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.prompt.as_bytes())
                .await
                .map_err(|e| ProviderError::Transport(format!("failed to write prompt: {}", e)))?;
        }

        let output = tokio::time::timeout(request.timeout, child.wait_with_output())
            .await
            .map_err(|_| ProviderError::Timeout(request.timeout))?
            .map_err(|e| ProviderError::Transport(format!("failed to wait for claude: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Self::classify_failure(output.status.code(), &stderr));
        }

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        if text.trim().is_empty() {
            return Err(ProviderError::Provider {
                status: None,
                message: "claude produced no output".to_string(),
                transient: false,
            });
        }
        Ok(text)
    }

    fn name(&self) -> &str {
        "claude-cli"
    }
}
