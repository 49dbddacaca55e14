//! Target repository registry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Repository entry as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Short name used on the command line (e.g. "fastapi-template").
    pub name: String,
    /// Human-readable name.
    #[serde(default)]
    pub display_name: String,
    /// Checkout directory, relative to `paths.repos_root` unless absolute.
    pub path: PathBuf,
    /// Sub-directory tests are run from (e.g. "backend").
    #[serde(default)]
    pub backend_path: PathBuf,
    /// Directory holding the benchmark test files.
    #[serde(default)]
    pub tests_dir: Option<PathBuf>,
    /// YAML task definition file.
    #[serde(default)]
    pub tasks_file: Option<PathBuf>,
    /// Knowledge base text for this repository.
    #[serde(default)]
    pub kb_file: Option<PathBuf>,
    /// Primary language of the codebase.
    #[serde(default = "default_language")]
    pub language: String,
    /// Upstream clone URL.
    #[serde(default)]
    pub git_url: Option<String>,
    /// Repository whose KB is used for the swapped condition.
    #[serde(default)]
    pub swap_with: Option<String>,
}

fn default_language() -> String {
    "python".to_string()
}

impl RepoConfig {
    /// Entry with only a name and checkout path; everything else defaulted.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        RepoConfig {
            name: name.into(),
            display_name: String::new(),
            path: path.into(),
            backend_path: PathBuf::new(),
            tests_dir: None,
            tasks_file: None,
            kb_file: None,
            language: default_language(),
            git_url: None,
            swap_with: None,
        }
    }

    /// Sets the sub-directory tests run from.
    pub fn with_backend_path(mut self, backend_path: impl Into<PathBuf>) -> Self {
        self.backend_path = backend_path.into();
        self
    }

    /// The two calibration repositories.
    pub fn defaults() -> Vec<RepoConfig> {
        vec![
            RepoConfig {
                name: "fastapi-template".to_string(),
                display_name: "FastAPI Full-Stack Template".to_string(),
                path: PathBuf::from("fastapi-template"),
                backend_path: PathBuf::from("backend"),
                tests_dir: None,
                tasks_file: None,
                kb_file: None,
                language: default_language(),
                git_url: Some(
                    "https://github.com/fastapi/full-stack-fastapi-template.git".to_string(),
                ),
                swap_with: Some("djangopackages".to_string()),
            },
            RepoConfig {
                name: "djangopackages".to_string(),
                display_name: "Django Packages".to_string(),
                path: PathBuf::from("djangopackages"),
                backend_path: PathBuf::new(),
                tests_dir: None,
                tasks_file: None,
                kb_file: None,
                language: default_language(),
                git_url: Some("https://github.com/djangopackages/djangopackages.git".to_string()),
                swap_with: Some("fastapi-template".to_string()),
            },
        ]
    }
}

/// A repository with every path resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repo {
    pub name: String,
    pub display_name: String,
    /// Checkout root copied into each workspace.
    pub root: PathBuf,
    pub backend_path: PathBuf,
    pub tests_dir: PathBuf,
    pub tasks_file: PathBuf,
    pub kb_file: PathBuf,
    pub language: String,
    pub git_url: Option<String>,
    pub swap_with: Option<String>,
}

impl Repo {
    /// Directory tests run from inside a workspace rooted at `workspace_root`.
    pub fn workdir(&self, workspace_root: &Path) -> PathBuf {
        if self.backend_path.as_os_str().is_empty() {
            workspace_root.to_path_buf()
        } else {
            workspace_root.join(&self.backend_path)
        }
    }
}

/// Registry of target repositories, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct RepoRegistry {
    order: Vec<String>,
    repos: BTreeMap<String, Repo>,
}

impl RepoRegistry {
    /// Builds the registry, resolving relative paths.
    ///
    /// `repos_root` holds the checkouts, `harness_dir` the per-repo `tasks.yaml`
    /// and `tests/`, and `kb_dir` the `kb_<name>.txt` knowledge bases.
    pub fn new(
        configs: &[RepoConfig],
        repos_root: &Path,
        harness_dir: &Path,
        kb_dir: &Path,
    ) -> Result<Self> {
        let mut registry = RepoRegistry::default();

        for config in configs {
            if config.name.trim().is_empty() {
                return Err(Error::Config("repository name cannot be empty".to_string()));
            }
            if registry.repos.contains_key(&config.name) {
                return Err(Error::Config(format!(
                    "repository '{}' is registered twice",
                    config.name
                )));
            }

            let harness = harness_dir.join("repos").join(&config.name);
            let repo = Repo {
                name: config.name.clone(),
                display_name: if config.display_name.is_empty() {
                    config.name.clone()
                } else {
                    config.display_name.clone()
                },
                root: resolve(repos_root, &config.path),
                backend_path: config.backend_path.clone(),
                tests_dir: config
                    .tests_dir
                    .as_ref()
                    .map(|p| resolve(harness_dir, p))
                    .unwrap_or_else(|| harness.join("tests")),
                tasks_file: config
                    .tasks_file
                    .as_ref()
                    .map(|p| resolve(harness_dir, p))
                    .unwrap_or_else(|| harness.join("tasks.yaml")),
                kb_file: config
                    .kb_file
                    .as_ref()
                    .map(|p| resolve(kb_dir, p))
                    .unwrap_or_else(|| kb_dir.join(format!("kb_{}.txt", config.name))),
                language: config.language.clone(),
                git_url: config.git_url.clone(),
                swap_with: config.swap_with.clone(),
            };

            registry.order.push(config.name.clone());
            registry.repos.insert(config.name.clone(), repo);
        }

        for repo in registry.repos.values() {
            if let Some(partner) = &repo.swap_with {
                if !registry.repos.contains_key(partner) {
                    return Err(Error::Config(format!(
                        "repository '{}' swaps with unknown repository '{}'",
                        repo.name, partner
                    )));
                }
            }
        }

        Ok(registry)
    }

    /// Looks up a repository by name.
    pub fn get(&self, name: &str) -> Result<&Repo> {
        self.repos
            .get(name)
            .ok_or_else(|| Error::UnknownRepo(name.to_string()))
    }

    /// Repository names in registration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// Repositories in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Repo> {
        self.order.iter().filter_map(|name| self.repos.get(name))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Repository whose KB serves as the negative control for `name`.
    ///
    /// Uses the explicit `swap_with` entry, otherwise the next repository in
    /// registration order (wrapping around).
    pub fn swap_partner(&self, name: &str) -> Result<&Repo> {
        let repo = self.get(name)?;
        if let Some(partner) = &repo.swap_with {
            if partner == name {
                return Err(Error::InvalidSwap(format!(
                    "repository '{}' cannot swap with itself",
                    name
                )));
            }
            return self.get(partner);
        }

        if self.order.len() < 2 {
            return Err(Error::InvalidSwap(format!(
                "no other repository registered to swap with '{}'",
                name
            )));
        }

        let index = self
            .order
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| Error::UnknownRepo(name.to_string()))?;
        let partner = &self.order[(index + 1) % self.order.len()];
        self.get(partner)
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
