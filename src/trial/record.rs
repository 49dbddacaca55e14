//! Trial records.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::Verdict;
use crate::patch::Patch;
use crate::prompt::Condition;
use crate::suite::TestOutcome;

/// Identifies one trial within an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrialKey {
    pub repo: String,
    pub task_id: String,
    pub condition: Condition,
}

impl TrialKey {
    pub fn new(repo: impl Into<String>, task_id: impl Into<String>, condition: Condition) -> Self {
        Self {
            repo: repo.into(),
            task_id: task_id.into(),
            condition,
        }
    }
}

impl fmt::Display for TrialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.repo, self.task_id, self.condition)
    }
}

/// Lifecycle of a trial. `Succeeded` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TrialStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TrialStatus::Succeeded | TrialStatus::Failed)
    }
}

/// Why a trial failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Retries or the deadline ran out on retryable provider errors.
    ProviderExhausted,
    /// The provider refused the request permanently.
    ProviderRejected,
    /// The response held no usable code change.
    NoPatchExtracted,
    /// The change could not be applied to the workspace.
    PatchApplyFailed,
    /// The test command crashed, timed out or could not start.
    TestRunnerFailed,
    /// The workspace could not be created.
    WorkspaceUnavailable,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::ProviderExhausted => "provider_exhausted",
            FailureReason::ProviderRejected => "provider_rejected",
            FailureReason::NoPatchExtracted => "no_patch_extracted",
            FailureReason::PatchApplyFailed => "patch_apply_failed",
            FailureReason::TestRunnerFailed => "test_runner_failed",
            FailureReason::WorkspaceUnavailable => "workspace_unavailable",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure with a human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub reason: FailureReason,
    pub detail: String,
}

/// Record of one task executed under one condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub experiment_id: String,
    pub repo: String,
    pub task_id: String,
    pub condition: Condition,
    pub provider: String,
    pub model_id: String,
    pub status: TrialStatus,
    /// Model output, empty when the provider never answered.
    #[serde(default)]
    pub raw_response: String,
    /// Stored copy of `raw_response`; `None` if it was never written.
    #[serde(default)]
    pub response_artifact: Option<PathBuf>,
    #[serde(default)]
    pub extracted_patch: Option<Patch>,
    /// Paths written by the patch, relative to the workspace root.
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub pre_test_outcome: Option<TestOutcome>,
    #[serde(default)]
    pub post_test_outcome: Option<TestOutcome>,
    #[serde(default)]
    pub verdict: Option<Verdict>,
    #[serde(default)]
    pub fixed: Vec<String>,
    #[serde(default)]
    pub broken: Vec<String>,
    /// Model round-trip time summed over every attempt, in milliseconds.
    /// Backoff sleeps are excluded.
    #[serde(default)]
    pub latency_ms: u64,
    /// Provider calls made, including the final one.
    #[serde(default)]
    pub attempts: u32,
    /// Wall-clock time of the whole trial, in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub failure: Option<Failure>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TrialResult {
    /// A pending record for `key`.
    pub fn new(
        experiment_id: impl Into<String>,
        key: &TrialKey,
        provider: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            repo: key.repo.clone(),
            task_id: key.task_id.clone(),
            condition: key.condition,
            provider: provider.into(),
            model_id: model_id.into(),
            status: TrialStatus::Pending,
            raw_response: String::new(),
            response_artifact: None,
            extracted_patch: None,
            files_modified: Vec::new(),
            pre_test_outcome: None,
            post_test_outcome: None,
            verdict: None,
            fixed: Vec::new(),
            broken: Vec::new(),
            latency_ms: 0,
            attempts: 0,
            duration_ms: 0,
            retry_count: 0,
            failure: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn key(&self) -> TrialKey {
        TrialKey::new(&self.repo, &self.task_id, self.condition)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        self.failure.as_ref().map(|f| f.reason)
    }

    /// Marks the trial failed.
    pub fn fail(&mut self, reason: FailureReason, detail: impl Into<String>) {
        self.status = TrialStatus::Failed;
        self.failure = Some(Failure {
            reason,
            detail: detail.into(),
        });
    }
}
