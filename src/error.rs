//! Error types for the benchmark harness.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure reported by an LLM provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider asked us to slow down.
    #[error("rate limited by provider")]
    RateLimited {
        /// Delay suggested by the provider, if any.
        retry_after: Option<Duration>,
    },

    /// The request did not complete in time.
    #[error("provider request timed out after {0:?}")]
    Timeout(Duration),

    /// Connection-level failure before a response was received.
    #[error("transport error: {0}")]
    Transport(String),

    /// The provider answered with an error.
    #[error("provider error (status {status:?}): {message}")]
    Provider {
        /// HTTP status or process exit code, when known.
        status: Option<u16>,
        /// Message returned by the provider.
        message: String,
        /// Whether retrying the same request may succeed.
        transient: bool,
    },
}

impl ProviderError {
    /// Returns true if the request is worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. } => true,
            ProviderError::Timeout(_) => true,
            ProviderError::Transport(_) => true,
            ProviderError::Provider { transient, .. } => *transient,
        }
    }

    /// Delay hint carried by the error, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Top-level error type for benchmark operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing configuration. Fatal before any trial starts.
    #[error("configuration error: {0}")]
    Config(String),

    /// Repository is not present in the registry.
    #[error("unknown repository: {0}")]
    UnknownRepo(String),

    /// Task id is not defined for the repository.
    #[error("unknown task '{task_id}' for repository '{repo}'")]
    UnknownTask { repo: String, task_id: String },

    /// Task definition file could not be loaded or failed validation.
    #[error("malformed task file {path}: {reason}")]
    MalformedTaskFile { path: PathBuf, reason: String },

    /// Knowledge base does not satisfy the swapped-condition contract.
    #[error("invalid knowledge base swap: {0}")]
    InvalidSwap(String),

    /// Patch could not be extracted or applied.
    #[error("patch error: {0}")]
    Patch(String),

    /// The external test command crashed or could not be run.
    #[error("test runner error: {0}")]
    TestRunner(String),

    /// Failed to create an isolated workspace.
    #[error("failed to create workspace: {0}")]
    Workspace(String),

    /// Failed to clean up a workspace.
    #[error("failed to clean up workspace at {path}: {reason}")]
    WorkspaceCleanup { path: PathBuf, reason: String },

    /// Experiment store inconsistency.
    #[error("experiment store error: {0}")]
    Store(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns true for errors that abort a whole run rather than one trial.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::UnknownRepo(_)
                | Error::UnknownTask { .. }
                | Error::MalformedTaskFile { .. }
                | Error::InvalidSwap(_)
        )
    }
}

/// Result type alias for benchmark operations.
pub type Result<T> = std::result::Result<T, Error>;
