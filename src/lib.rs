//! Aspect Bench - measures whether knowledge-base context improves LLM code changes
//!
//! This library turns declarative task definitions into trials (task × prompting
//! condition), runs each trial in an isolated workspace against a completion
//! provider and the target repository's test suite, and aggregates the
//! before/after test outcomes into comparable reports.

pub mod analysis;
pub mod backoff;
pub mod config;
pub mod error;
pub mod experiment;
pub mod patch;
pub mod prompt;
pub mod provider;
pub mod registry;
pub mod report;
pub mod store;
pub mod suite;
pub mod trial;
pub mod workspace;

pub use analysis::{compare, summarize, Comparison, ExperimentSummary, Verdict};
pub use backoff::{ExponentialBackoff, RetryDecision, RetryPolicy, RetryState};
pub use config::{BenchConfig, ProviderConfig, ProviderKind, RunConfig, Validate, ValidationResult};
pub use error::{Error, ProviderError, Result};
pub use experiment::{ExperimentPlan, ExperimentRunner, RunSummary, Selection};
pub use patch::{FileReplacement, Patch};
pub use prompt::{Condition, KnowledgeBase, Prompt, PromptCompiler, PromptStore};
pub use provider::{CompletionProvider, CompletionRequest};
pub use registry::{Repo, RepoConfig, RepoRegistry, TaskDefinition, TaskRegistry, TestSelector};
pub use store::{list_experiments, new_experiment_id, ExperimentRecord, ExperimentStore, Manifest};
pub use suite::{PytestRunner, TestOutcome, TestRunRequest, TestRunner, TestStatus};
pub use trial::{Failure, FailureReason, TrialExecutor, TrialKey, TrialResult, TrialSpec, TrialStatus};
pub use workspace::{Workspace, WorkspaceProvider};
