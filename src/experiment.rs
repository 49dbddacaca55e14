//! Experiment planning and execution.
//!
//! A plan expands repositories × tasks × conditions into trial specs with
//! every prompt compiled up front, so configuration problems surface before
//! any trial starts. The runner executes pending trials concurrently up to a
//! parallelism limit and persists each one as soon as it finishes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::error::{Error, Result};
use crate::prompt::{Condition, KnowledgeBase, PromptCompiler, PromptStore};
use crate::registry::{RepoRegistry, TaskRegistry};
use crate::store::Manifest;
use crate::trial::{wait_cancelled, FailureReason, TrialExecutor, TrialKey, TrialResult, TrialSpec, TrialStatus};

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub repos: Vec<String>,
    /// Task ids; `None` selects every task.
    pub tasks: Option<Vec<String>>,
    pub conditions: Vec<Condition>,
}

/// Fully compiled list of trials.
#[derive(Debug, Clone)]
pub struct ExperimentPlan {
    pub selection: Selection,
    pub trials: Vec<TrialSpec>,
}

impl ExperimentPlan {
    /// Expands the selection and compiles every prompt.
    ///
    /// Compiled prompts are persisted to `prompts` when given.
    pub fn build(
        repos: &RepoRegistry,
        tasks: &TaskRegistry,
        compiler: &PromptCompiler,
        selection: Selection,
        prompts: Option<&PromptStore>,
    ) -> Result<Self> {
        if selection.repos.is_empty() {
            return Err(Error::Config("no repositories selected".to_string()));
        }
        if selection.conditions.is_empty() {
            return Err(Error::Config("no conditions selected".to_string()));
        }

        if let Some(ids) = &selection.tasks {
            for id in ids {
                let known = selection
                    .repos
                    .iter()
                    .any(|repo| tasks.get(repo, id).is_ok());
                if !known {
                    return Err(Error::UnknownTask {
                        repo: selection.repos.join(","),
                        task_id: id.clone(),
                    });
                }
            }
        }

        let mut kbs: BTreeMap<String, KnowledgeBase> = BTreeMap::new();
        let mut trials = Vec::new();

        for repo_name in &selection.repos {
            let repo = repos.get(repo_name)?;
            let ids = selection.tasks.as_ref().map(|ids| {
                ids.iter()
                    .filter(|id| tasks.get(repo_name, id).is_ok())
                    .cloned()
                    .collect::<Vec<_>>()
            });

            for task in tasks.select(repo_name, ids.as_deref())? {
                for &condition in &selection.conditions {
                    let kb_repo = match condition {
                        Condition::Baseline | Condition::NoKb => None,
                        Condition::AspectKb => Some(repo),
                        Condition::Swapped => Some(repos.swap_partner(repo_name)?),
                    };
                    let kb = match kb_repo {
                        Some(source) => {
                            if !kbs.contains_key(&source.name) {
                                kbs.insert(source.name.clone(), KnowledgeBase::load(source)?);
                            }
                            kbs.get(&source.name)
                        }
                        None => None,
                    };

                    let mut prompt = compiler.compile(repo_name, task, condition, kb)?;
                    if let Some(store) = prompts {
                        prompt = store.save(&prompt)?;
                    }

                    trials.push(TrialSpec {
                        key: TrialKey::new(repo_name, &task.id, condition),
                        repo: repo.clone(),
                        task: task.clone(),
                        prompt,
                    });
                }
            }
        }

        tracing::info!(
            repos = selection.repos.len(),
            conditions = selection.conditions.len(),
            trials = trials.len(),
            "experiment planned"
        );

        Ok(Self { selection, trials })
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }
}

/// Outcome counts of one `run` invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub experiment_id: String,
    pub planned: usize,
    /// Trials that reached a terminal state in this run.
    pub attempted: usize,
    /// Trials already stored by an earlier run.
    pub skipped: usize,
    pub succeeded: usize,
    pub failed_by_reason: BTreeMap<FailureReason, usize>,
    /// Trials discarded by cancellation or a crashed task; rerun on resume.
    pub incomplete: usize,
    pub interrupted: bool,
}

impl RunSummary {
    fn record(&mut self, trial: &TrialResult) {
        self.attempted += 1;
        match trial.status {
            TrialStatus::Succeeded => self.succeeded += 1,
            _ => {
                let reason = trial
                    .failure_reason()
                    .unwrap_or(FailureReason::TestRunnerFailed);
                *self.failed_by_reason.entry(reason).or_default() += 1;
            }
        }
    }

    pub fn failed(&self) -> usize {
        self.failed_by_reason.values().sum()
    }

    /// Planned trials with no stored result after this run.
    pub fn remaining(&self) -> usize {
        self.planned.saturating_sub(self.skipped + self.attempted)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Experiment {}", self.experiment_id)?;
        writeln!(
            f,
            "  planned {}, skipped {}, attempted {}",
            self.planned, self.skipped, self.attempted
        )?;
        writeln!(f, "  succeeded {}, failed {}", self.succeeded, self.failed())?;
        for (reason, count) in &self.failed_by_reason {
            writeln!(f, "    {}: {}", reason, count)?;
        }
        if self.interrupted {
            writeln!(
                f,
                "  interrupted: {} trial(s) left for resume",
                self.remaining()
            )?;
        }
        Ok(())
    }
}

/// How a spawned trial task ended.
enum TrialExit {
    Stored(TrialResult),
    /// Terminal, but the append to the trial log failed.
    Unstored(TrialKey, Error),
    /// Cancelled; nothing to store.
    Discarded,
}

/// Runs plans with bounded parallelism.
pub struct ExperimentRunner {
    executor: Arc<TrialExecutor>,
    parallelism: usize,
}

impl ExperimentRunner {
    pub fn new(executor: TrialExecutor, parallelism: usize) -> Self {
        Self {
            executor: Arc::new(executor),
            parallelism: parallelism.max(1),
        }
    }

    fn manifest(&self, plan: &ExperimentPlan) -> Manifest {
        let config = self.executor.provider_config();
        Manifest {
            experiment_id: self.executor.store().id().to_string(),
            provider: self.executor.provider_name().to_string(),
            model: config.model(),
            temperature: config.temperature,
            max_tokens: config.max_tokens(),
            repos: plan.selection.repos.clone(),
            conditions: plan.selection.conditions.clone(),
            tasks: plan.selection.tasks.clone(),
            started_at: Utc::now(),
        }
    }

    /// Executes every trial of `plan` not already stored.
    ///
    /// A trial that cannot be appended to the store stops scheduling and fails
    /// the run with [`Error::Store`] once in-flight trials drain.
    ///
    /// When `cancel` fires no new trials start; running ones stop at their
    /// next step boundary and release their workspaces. The experiment
    /// document is rewritten in every case.
    pub async fn run(&self, plan: &ExperimentPlan, cancel: watch::Receiver<bool>) -> Result<RunSummary> {
        let store = Arc::clone(self.executor.store());

        let manifest = self.manifest(plan);
        match store.load_manifest()? {
            None => store.save_manifest(&manifest)?,
            Some(existing) => {
                if existing.model != manifest.model || existing.provider != manifest.provider {
                    tracing::warn!(
                        experiment = %store.id(),
                        stored_model = %existing.model,
                        model = %manifest.model,
                        "resuming with a different provider or model"
                    );
                }
            }
        }

        let done = store.completed()?;
        let pending: Vec<&TrialSpec> = plan.trials.iter().filter(|t| !done.contains(&t.key)).collect();

        let mut summary = RunSummary {
            experiment_id: store.id().to_string(),
            planned: plan.len(),
            skipped: plan.len() - pending.len(),
            ..RunSummary::default()
        };

        tracing::info!(
            experiment = %store.id(),
            pending = pending.len(),
            skipped = summary.skipped,
            parallelism = self.parallelism,
            "starting experiment"
        );

        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let store_failed = Arc::new(AtomicBool::new(false));
        let mut set = JoinSet::new();
        let mut waiter = cancel.clone();

        for spec in pending {
            if *cancel.borrow() {
                summary.interrupted = true;
                break;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = wait_cancelled(&mut waiter) => {
                    summary.interrupted = true;
                    break;
                }
            };
            if store_failed.load(Ordering::SeqCst) {
                break;
            }

            let executor = Arc::clone(&self.executor);
            let cancel = cancel.clone();
            let store_failed = Arc::clone(&store_failed);
            let spec = spec.clone();
            set.spawn(async move {
                let _permit = permit;
                let Some(trial) = executor.run(&spec, cancel).await else {
                    return TrialExit::Discarded;
                };
                match executor.store().append(&trial) {
                    Ok(()) => TrialExit::Stored(trial),
                    Err(e) => {
                        store_failed.store(true, Ordering::SeqCst);
                        TrialExit::Unstored(spec.key, e)
                    }
                }
            });
        }

        let mut unstored = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(TrialExit::Stored(trial)) => summary.record(&trial),
                Ok(TrialExit::Unstored(key, e)) => {
                    tracing::error!(trial = %key, error = %e, "failed to store trial");
                    unstored.push(format!("{}: {}", key, e));
                }
                Ok(TrialExit::Discarded) => summary.incomplete += 1,
                Err(e) => {
                    tracing::error!(error = %e, "trial task aborted");
                    summary.incomplete += 1;
                }
            }
        }

        if *cancel.borrow() {
            summary.interrupted = true;
        }

        let finalized = store.finalize();
        if !unstored.is_empty() {
            if let Err(e) = finalized {
                tracing::error!(experiment = %store.id(), error = %e, "failed to write experiment record");
            }
            return Err(Error::Store(format!(
                "{} trial(s) finished but could not be stored ({} stored); first: {}",
                unstored.len(),
                summary.attempted,
                unstored[0]
            )));
        }
        finalized?;

        tracing::info!(
            experiment = %store.id(),
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed(),
            interrupted = summary.interrupted,
            "experiment finished"
        );
        Ok(summary)
    }
}
