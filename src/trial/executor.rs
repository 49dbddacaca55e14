//! Trial executor.
//!
//! Drives one trial through its steps in order: acquire a workspace and
//! record the pre-change outcome, invoke the model (with retries), extract
//! and apply the patch, record the post-change outcome, release the
//! workspace. Every error inside a trial becomes a [`Failure`] on the record;
//! nothing propagates to sibling trials.
//!
//! [`Failure`]: super::Failure

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;

use crate::analysis::compare;
use crate::backoff::{RetryDecision, RetryPolicy};
use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::patch;
use crate::prompt::Prompt;
use crate::provider::{CompletionProvider, CompletionRequest};
use crate::registry::{Repo, TaskDefinition};
use crate::store::ExperimentStore;
use crate::suite::{TestRunRequest, TestRunner};
use crate::workspace::{Workspace, WorkspaceProvider};

use super::{FailureReason, TrialKey, TrialResult, TrialStatus};

/// Everything needed to run one trial.
#[derive(Debug, Clone)]
pub struct TrialSpec {
    pub key: TrialKey,
    pub repo: Repo,
    pub task: TaskDefinition,
    pub prompt: Prompt,
}

/// How a trial body ended.
enum Flow {
    /// The record holds a terminal status.
    Finished,
    /// The run was cancelled; the record is discarded.
    Cancelled,
}

/// Result of the model invocation step.
enum Invocation {
    Text(String),
    Failed,
    Cancelled,
}

/// Executes trials against shared provider, test runner and workspace factory.
pub struct TrialExecutor {
    provider: Arc<dyn CompletionProvider>,
    runner: Arc<dyn TestRunner>,
    workspaces: Arc<dyn WorkspaceProvider>,
    store: Arc<ExperimentStore>,
    provider_config: ProviderConfig,
    retry: RetryPolicy,
    test_timeout: Duration,
}

impl TrialExecutor {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        runner: Arc<dyn TestRunner>,
        workspaces: Arc<dyn WorkspaceProvider>,
        store: Arc<ExperimentStore>,
    ) -> Self {
        Self {
            provider,
            runner,
            workspaces,
            store,
            provider_config: ProviderConfig::default(),
            retry: RetryPolicy::default(),
            test_timeout: Duration::from_secs(600),
        }
    }

    /// Sets model, token limit, temperature and request timeout.
    pub fn with_provider_config(mut self, config: ProviderConfig) -> Self {
        self.provider_config = config;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_test_timeout(mut self, timeout: Duration) -> Self {
        self.test_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<ExperimentStore> {
        &self.store
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn provider_config(&self) -> &ProviderConfig {
        &self.provider_config
    }

    /// Runs one trial to a terminal state.
    ///
    /// Returns `None` if `cancel` fired; the workspace is released either way.
    pub async fn run(&self, spec: &TrialSpec, mut cancel: watch::Receiver<bool>) -> Option<TrialResult> {
        let started = Instant::now();
        let mut trial = TrialResult::new(
            self.store.id(),
            &spec.key,
            self.provider.name(),
            self.provider_config.model(),
        );
        trial.status = TrialStatus::Running;

        tracing::info!(
            repo = %spec.key.repo,
            task_id = %spec.key.task_id,
            condition = %spec.key.condition,
            "starting trial"
        );

        let flow = match self.workspaces.create(&spec.repo) {
            Ok(mut workspace) => {
                let flow = self.execute(spec, &mut trial, workspace.as_ref(), &mut cancel).await;
                if let Err(e) = workspace.cleanup() {
                    tracing::error!(trial = %spec.key, error = %e, "failed to release workspace");
                }
                flow
            }
            Err(e) => {
                trial.fail(FailureReason::WorkspaceUnavailable, e.to_string());
                Flow::Finished
            }
        };

        match flow {
            Flow::Cancelled => {
                tracing::info!(trial = %spec.key, "trial cancelled");
                None
            }
            Flow::Finished => {
                trial.finished_at = Some(Utc::now());
                trial.duration_ms = millis(started.elapsed());
                log_finished(&trial);
                Some(trial)
            }
        }
    }

    async fn execute(
        &self,
        spec: &TrialSpec,
        trial: &mut TrialResult,
        workspace: &dyn Workspace,
        cancel: &mut watch::Receiver<bool>,
    ) -> Flow {
        let request = TestRunRequest {
            workdir: spec.repo.workdir(workspace.path()),
            selector: spec.task.validation.clone(),
            timeout: self.test_timeout,
        };

        let pre = match self.runner.run(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                trial.fail(
                    FailureReason::TestRunnerFailed,
                    format!("pre-change run: {}", e),
                );
                return Flow::Finished;
            }
        };
        if pre.is_empty() {
            tracing::warn!(trial = %spec.key, "pre-change run reported no tests");
        }
        trial.pre_test_outcome = Some(pre.clone());

        if is_cancelled(cancel) {
            return Flow::Cancelled;
        }

        let text = match self.invoke(&spec.prompt.compiled_text, trial, cancel).await {
            Invocation::Text(text) => text,
            Invocation::Failed => return Flow::Finished,
            Invocation::Cancelled => return Flow::Cancelled,
        };

        match self.store.write_response(&spec.key, &text) {
            Ok(path) => trial.response_artifact = Some(path),
            Err(e) => {
                tracing::warn!(trial = %spec.key, error = %e, "failed to write response artifact");
                trial.response_artifact = None;
            }
        }
        trial.raw_response = text;

        if is_cancelled(cancel) {
            return Flow::Cancelled;
        }

        let Some(patch) = patch::extract(&trial.raw_response, spec.task.patch_format) else {
            trial.fail(
                FailureReason::NoPatchExtracted,
                format!("no {:?} change found in response", spec.task.patch_format),
            );
            return Flow::Finished;
        };

        let applied = patch::apply(&patch, workspace.path(), &spec.repo.backend_path);
        trial.extracted_patch = Some(patch);
        match applied {
            Ok(files) => trial.files_modified = files,
            Err(e) => {
                // Application is atomic, so the workspace still matches the baseline.
                trial.post_test_outcome = Some(pre);
                trial.fail(FailureReason::PatchApplyFailed, e.to_string());
                return Flow::Finished;
            }
        }

        if is_cancelled(cancel) {
            return Flow::Cancelled;
        }

        let mut post = match self.runner.run(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                trial.fail(
                    FailureReason::TestRunnerFailed,
                    format!("post-change run: {}", e),
                );
                return Flow::Finished;
            }
        };
        post.reconcile(&pre);

        let comparison = compare(&pre, &post);
        trial.fixed = comparison.fixed.into_iter().collect();
        trial.broken = comparison.broken.into_iter().collect();
        trial.verdict = Some(comparison.verdict);
        trial.post_test_outcome = Some(post);
        trial.status = TrialStatus::Succeeded;
        Flow::Finished
    }

    /// Calls the provider under the retry state machine.
    async fn invoke(
        &self,
        prompt: &str,
        trial: &mut TrialResult,
        cancel: &mut watch::Receiver<bool>,
    ) -> Invocation {
        let request = CompletionRequest::from_config(prompt, &self.provider_config);
        let mut retry = self.retry.start();

        let mut latency = Duration::ZERO;
        loop {
            let attempt = Instant::now();
            let result = match tokio::time::timeout(request.timeout, self.provider.complete(&request)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(request.timeout)),
            };
            latency += attempt.elapsed();
            trial.attempts += 1;
            trial.latency_ms = millis(latency);

            let err = match result {
                Ok(text) => {
                    trial.retry_count = retry.retries();
                    return Invocation::Text(text);
                }
                Err(err) => err,
            };

            match retry.on_error(&err) {
                RetryDecision::Retry(delay) => {
                    tracing::warn!(
                        trial = %trial.key(),
                        retry = retry.retries(),
                        delay_ms = millis(delay),
                        error = %err,
                        "provider call failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = wait_cancelled(cancel) => return Invocation::Cancelled,
                    }
                }
                RetryDecision::Reject => {
                    trial.retry_count = retry.retries();
                    trial.fail(FailureReason::ProviderRejected, err.to_string());
                    return Invocation::Failed;
                }
                RetryDecision::Exhausted => {
                    trial.retry_count = retry.retries();
                    trial.fail(
                        FailureReason::ProviderExhausted,
                        format!("{} (after {} retries)", err, retry.retries()),
                    );
                    return Invocation::Failed;
                }
            }
        }
    }
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

/// Resolves once cancellation is signalled; never if the sender is gone.
pub(crate) async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn log_finished(trial: &TrialResult) {
    match (&trial.failure, trial.verdict) {
        (Some(failure), _) => tracing::warn!(
            trial = %trial.key(),
            reason = %failure.reason,
            detail = %failure.detail,
            "trial failed"
        ),
        (None, Some(verdict)) => tracing::info!(
            trial = %trial.key(),
            verdict = %verdict,
            fixed = trial.fixed.len(),
            broken = trial.broken.len(),
            duration_ms = trial.duration_ms,
            "trial succeeded"
        ),
        (None, None) => tracing::info!(trial = %trial.key(), "trial finished"),
    }
}
