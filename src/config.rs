//! Benchmark configuration.
//!
//! Loaded from a TOML file and validated before any trial starts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::RetryPolicy;
use crate::error::{Error, Result};
use crate::prompt::Condition;
use crate::registry::{RepoConfig, RepoRegistry};

/// Configuration file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "aspect-bench.toml";

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

/// Which completion backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// Anthropic Messages API.
    #[default]
    Anthropic,
    /// OpenAI Chat Completions API.
    Openai,
    /// Local `claude` CLI in print mode.
    ClaudeCli,
}

impl ProviderKind {
    /// Stable identifier used in manifests and on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Openai => "openai",
            ProviderKind::ClaudeCli => "claude-cli",
        }
    }

    /// Model used when none is configured.
    pub fn default_model(self) -> &'static str {
        match self {
            ProviderKind::Anthropic | ProviderKind::ClaudeCli => "claude-sonnet-4-20250514",
            ProviderKind::Openai => "gpt-4o",
        }
    }

    /// Output token limit used when none is configured.
    pub fn default_max_tokens(self) -> u32 {
        match self {
            ProviderKind::Anthropic | ProviderKind::ClaudeCli => 16000,
            ProviderKind::Openai => 8000,
        }
    }

    /// Environment variable holding the API key, if the backend needs one.
    pub fn api_key_env(self) -> Option<&'static str> {
        match self {
            ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            ProviderKind::Openai => Some("OPENAI_API_KEY"),
            ProviderKind::ClaudeCli => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "anthropic" => Ok(ProviderKind::Anthropic),
            "openai" => Ok(ProviderKind::Openai),
            "claude-cli" | "claude" => Ok(ProviderKind::ClaudeCli),
            other => Err(Error::Config(format!("unknown provider '{}'", other))),
        }
    }
}

/// Completion provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Backend to call.
    #[serde(default)]
    pub kind: ProviderKind,
    /// Model identifier; defaults per backend.
    #[serde(default)]
    pub model: Option<String>,
    /// Output token limit; defaults per backend.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    #[serde(default)]
    pub temperature: f32,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
    /// Overrides the API base URL (proxies, tests).
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_request_timeout() -> u64 {
    300
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            model: None,
            max_tokens: None,
            temperature: 0.0,
            timeout_secs: default_request_timeout(),
            base_url: None,
        }
    }
}

impl ProviderConfig {
    /// Configured model, or the backend default.
    pub fn model(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| self.kind.default_model().to_string())
    }

    /// Configured token limit, or the backend default.
    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
            .unwrap_or_else(|| self.kind.default_max_tokens())
    }

    /// Returns the request timeout as a Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Reads the API key from the environment.
    ///
    /// Returns `Ok(None)` for backends that need no key.
    pub fn api_key(&self) -> Result<Option<String>> {
        match self.kind.api_key_env() {
            None => Ok(None),
            Some(var) => match std::env::var(var) {
                Ok(key) if !key.trim().is_empty() => Ok(Some(key)),
                _ => Err(Error::Config(format!(
                    "{} is not set (required by the {} provider)",
                    var, self.kind
                ))),
            },
        }
    }
}

/// How trial workspaces are created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceKind {
    /// Full copy of the working tree.
    #[default]
    Copy,
    /// Detached `git worktree`.
    Worktree,
}

/// Run scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Trials executed concurrently.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Timeout for one test-suite invocation, in seconds.
    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,
    /// Conditions run for every task.
    #[serde(default = "default_conditions")]
    pub conditions: Vec<Condition>,
    /// Workspace strategy.
    #[serde(default)]
    pub workspace: WorkspaceKind,
    /// Directory names never copied into a workspace.
    #[serde(default = "default_skip_dirs")]
    pub skip_dirs: Vec<String>,
}

fn default_parallelism() -> usize {
    2
}

fn default_test_timeout() -> u64 {
    600
}

fn default_conditions() -> Vec<Condition> {
    Condition::ALL.to_vec()
}

fn default_skip_dirs() -> Vec<String> {
    [".venv", "node_modules", "__pycache__", ".pytest_cache"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            test_timeout_secs: default_test_timeout(),
            conditions: default_conditions(),
            workspace: WorkspaceKind::default(),
            skip_dirs: default_skip_dirs(),
        }
    }
}

impl RunConfig {
    /// Returns the test timeout as a Duration.
    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }
}

/// Filesystem locations. Relative paths are resolved against the
/// directory holding the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Per-repository `tasks.yaml` and benchmark tests live under `<harness_dir>/repos/<name>`.
    #[serde(default = "default_harness_dir")]
    pub harness_dir: PathBuf,
    /// Checkouts of the target repositories.
    #[serde(default = "default_repos_root")]
    pub repos_root: PathBuf,
    /// Knowledge base text files.
    #[serde(default = "default_kb_dir")]
    pub kb_dir: PathBuf,
    /// Shared instructions file with the instruction markers.
    #[serde(default = "default_instructions_file")]
    pub instructions_file: PathBuf,
    /// Experiment results.
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    /// Compiled prompts.
    #[serde(default = "default_prompts_dir")]
    pub prompts_dir: PathBuf,
    /// Scratch space for trial workspaces.
    #[serde(default = "default_workspaces_dir")]
    pub workspaces_dir: PathBuf,
}

fn default_harness_dir() -> PathBuf {
    PathBuf::from("harness")
}

fn default_repos_root() -> PathBuf {
    PathBuf::from("repos")
}

fn default_kb_dir() -> PathBuf {
    PathBuf::from("kb")
}

fn default_instructions_file() -> PathBuf {
    PathBuf::from("AGENTS.md")
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_prompts_dir() -> PathBuf {
    PathBuf::from("prompts")
}

fn default_workspaces_dir() -> PathBuf {
    std::env::temp_dir().join("aspect-bench")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            harness_dir: default_harness_dir(),
            repos_root: default_repos_root(),
            kb_dir: default_kb_dir(),
            instructions_file: default_instructions_file(),
            results_dir: default_results_dir(),
            prompts_dir: default_prompts_dir(),
            workspaces_dir: default_workspaces_dir(),
        }
    }
}

impl PathsConfig {
    /// Returns a copy with every relative path joined onto `base`.
    pub fn rooted(&self, base: &Path) -> PathsConfig {
        let join = |p: &PathBuf| {
            if p.is_absolute() {
                p.clone()
            } else {
                base.join(p)
            }
        };
        PathsConfig {
            harness_dir: join(&self.harness_dir),
            repos_root: join(&self.repos_root),
            kb_dir: join(&self.kb_dir),
            instructions_file: join(&self.instructions_file),
            results_dir: join(&self.results_dir),
            prompts_dir: join(&self.prompts_dir),
            workspaces_dir: join(&self.workspaces_dir),
        }
    }
}

/// Top-level benchmark configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Completion provider.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Retry policy for model invocations.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Scheduling.
    #[serde(default)]
    pub run: RunConfig,
    /// Filesystem layout.
    #[serde(default)]
    pub paths: PathsConfig,
    /// Target repositories, in reporting order.
    #[serde(default = "RepoConfig::defaults")]
    pub repos: Vec<RepoConfig>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            retry: RetryPolicy::default(),
            run: RunConfig::default(),
            paths: PathsConfig::default(),
            repos: RepoConfig::defaults(),
        }
    }
}

impl BenchConfig {
    /// Parses configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("invalid configuration: {}", e)))
    }

    /// Loads a configuration file, resolving relative paths against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read configuration {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml_str(&content)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.paths = config.paths.rooted(base);
        tracing::debug!(path = ?path, repos = config.repos.len(), "loaded configuration");
        Ok(config)
    }

    /// Loads `path` if given, else `DEFAULT_CONFIG_FILE` when present, else defaults.
    pub fn discover(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::load(default)
                } else {
                    tracing::debug!("no configuration file, using defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    /// Builds the repository registry described by this configuration.
    pub fn registry(&self) -> Result<RepoRegistry> {
        RepoRegistry::new(
            &self.repos,
            &self.paths.repos_root,
            &self.paths.harness_dir,
            &self.paths.kb_dir,
        )
    }
}

impl Validate for ProviderConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if let Some(model) = &self.model {
            if model.trim().is_empty() {
                result.add_error("provider.model cannot be empty");
            }
        }

        if self.max_tokens == Some(0) {
            result.add_error("provider.max_tokens must be at least 1");
        }

        if !(0.0..=2.0).contains(&self.temperature) {
            result.add_error("provider.temperature must be between 0.0 and 2.0");
        }

        if self.timeout_secs == 0 {
            result.add_error("provider.timeout_secs must be at least 1");
        }

        if self.temperature > 0.0 {
            result.add_warning("non-zero temperature makes trials harder to reproduce");
        }

        result
    }
}

impl Validate for RetryPolicy {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.initial_backoff > self.max_backoff {
            result.add_error("retry.initial_backoff_ms must not exceed retry.max_backoff_ms");
        }

        if self.deadline.is_zero() {
            result.add_error("retry.deadline_ms must be positive");
        }

        if self.max_retries > 10 {
            result.add_warning("retry.max_retries > 10 may hammer a rate-limited provider");
        }

        result
    }
}

impl Validate for RunConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.parallelism == 0 {
            result.add_error("run.parallelism must be at least 1");
        }

        if self.parallelism > 16 {
            result.add_warning("run.parallelism > 16 is likely to trigger provider rate limits");
        }

        if self.test_timeout_secs == 0 {
            result.add_error("run.test_timeout_secs must be at least 1");
        }

        if self.conditions.is_empty() {
            result.add_error("run.conditions cannot be empty");
        }

        let mut seen = Vec::new();
        for condition in &self.conditions {
            if seen.contains(condition) {
                result.add_warning(format!("condition '{}' listed more than once", condition));
            } else {
                seen.push(*condition);
            }
        }

        result
    }
}

impl Validate for BenchConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        result.merge(self.provider.validate());
        result.merge(self.retry.validate());
        result.merge(self.run.validate());

        if self.repos.is_empty() {
            result.add_error("at least one repository must be configured");
        }

        if self.run.conditions.contains(&Condition::Swapped) && self.repos.len() < 2 {
            result.add_error("the swapped condition needs at least two repositories");
        }

        if self.retry.deadline < self.provider.timeout() {
            result.add_warning("retry.deadline_ms is shorter than one provider request timeout");
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bench_config_has_sensible_defaults() {
        let config = BenchConfig::default();

        assert_eq!(config.provider.kind, ProviderKind::Anthropic);
        assert_eq!(config.provider.model(), "claude-sonnet-4-20250514");
        assert_eq!(config.provider.max_tokens(), 16000);
        assert_eq!(config.provider.temperature, 0.0);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.run.conditions, Condition::ALL.to_vec());
        assert_eq!(config.repos.len(), 2);
        assert!(config.validate().is_valid());
    }

    #[test]
    fn openai_defaults_differ() {
        let provider = ProviderConfig {
            kind: ProviderKind::Openai,
            ..ProviderConfig::default()
        };
        assert_eq!(provider.model(), "gpt-4o");
        assert_eq!(provider.max_tokens(), 8000);
    }

    #[test]
    fn deserializes_from_toml() {
        let toml = r#"
            [provider]
            kind = "openai"
            model = "gpt-4o-mini"

            [retry]
            max_retries = 1

            [run]
            parallelism = 4
            conditions = ["baseline", "aspect_kb"]
            workspace = "worktree"

            [paths]
            results_dir = "/tmp/results"

            [[repos]]
            name = "solo"
            path = "solo"
        "#;

        let config = BenchConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.provider.kind, ProviderKind::Openai);
        assert_eq!(config.provider.model(), "gpt-4o-mini");
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.run.parallelism, 4);
        assert_eq!(
            config.run.conditions,
            vec![Condition::Baseline, Condition::AspectKb]
        );
        assert_eq!(config.run.workspace, WorkspaceKind::Worktree);
        assert_eq!(config.repos.len(), 1);
        assert_eq!(config.repos[0].language, "python");
        assert!(config.validate().is_valid());
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = BenchConfig::from_toml_str("[run]\nparallelism = \"many\"").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn load_roots_relative_paths() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bench.toml");
        std::fs::write(&path, "[paths]\nresults_dir = \"out\"\nprompts_dir = \"/abs/prompts\"\n")
            .unwrap();

        let config = BenchConfig::load(&path).unwrap();
        assert_eq!(config.paths.results_dir, dir.path().join("out"));
        assert_eq!(config.paths.prompts_dir, PathBuf::from("/abs/prompts"));
        assert_eq!(config.paths.kb_dir, dir.path().join("kb"));
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = BenchConfig::load(Path::new("/nonexistent/bench.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn zero_parallelism_fails() {
        let mut config = BenchConfig::default();
        config.run.parallelism = 0;
        let result = config.validate();
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.contains("parallelism")));
    }

    #[test]
    fn empty_conditions_fail() {
        let mut config = BenchConfig::default();
        config.run.conditions.clear();
        assert!(!config.validate().is_valid());
    }

    #[test]
    fn duplicate_condition_warns() {
        let mut config = BenchConfig::default();
        config.run.conditions = vec![Condition::Baseline, Condition::Baseline];
        let result = config.validate();
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("baseline")));
    }

    #[test]
    fn swapped_needs_two_repos() {
        let mut config = BenchConfig::default();
        config.repos.truncate(1);
        config.repos[0].swap_with = None;
        let result = config.validate();
        assert!(result.errors.iter().any(|e| e.contains("swapped")));
    }

    #[test]
    fn inverted_backoff_fails() {
        let mut config = BenchConfig::default();
        config.retry.initial_backoff = Duration::from_secs(120);
        assert!(!config.validate().is_valid());
    }

    #[test]
    fn temperature_out_of_range_fails() {
        let mut config = BenchConfig::default();
        config.provider.temperature = 3.5;
        assert!(!config.validate().is_valid());
    }

    #[test]
    fn nonzero_temperature_warns() {
        let mut config = BenchConfig::default();
        config.provider.temperature = 0.7;
        let result = config.validate();
        assert!(result.is_valid());
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn provider_kind_parses() {
        assert_eq!("claude-cli".parse::<ProviderKind>().unwrap(), ProviderKind::ClaudeCli);
        assert_eq!("OpenAI".parse::<ProviderKind>().unwrap(), ProviderKind::Openai);
        assert!("cohere".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn claude_cli_needs_no_key() {
        let provider = ProviderConfig {
            kind: ProviderKind::ClaudeCli,
            ..ProviderConfig::default()
        };
        assert_eq!(provider.api_key().unwrap(), None);
    }

    #[test]
    fn validation_result_into_result_err_on_invalid() {
        let mut result = ValidationResult::default();
        result.add_error("first");
        result.add_error("second");
        match result.into_result() {
            Err(Error::Config(msg)) => assert_eq!(msg, "first; second"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
