//! Task definitions and the per-repository task registry.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::repo::{Repo, RepoRegistry};

/// Shape of the code change the model is asked to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchFormat {
    /// Complete file contents in fenced blocks tagged with `# filepath:`.
    #[default]
    FullFile,
    /// A unified diff.
    Diff,
}

/// Rough difficulty label carried over from the task file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

/// Which tests measure a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSelector {
    /// Test files to run. Empty means the whole suite.
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// Pytest marker expression restricting the selection.
    #[serde(default)]
    pub marker: Option<String>,
    /// Extra files run with `-m regression` to catch side effects.
    #[serde(default)]
    pub regression_files: Vec<PathBuf>,
}

impl TestSelector {
    /// Returns true if the selector covers the whole suite.
    pub fn is_all(&self) -> bool {
        self.files.is_empty()
    }

    fn resolve(&mut self, base: &Path) {
        for file in self.files.iter_mut().chain(self.regression_files.iter_mut()) {
            if file.is_relative() {
                *file = base.join(&*file);
            }
        }
    }
}

/// A single benchmark task. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Stable identifier, unique within the repository.
    pub id: String,
    pub name: String,
    pub description: String,
    /// Files the change is expected to touch.
    #[serde(default)]
    pub target_files: Vec<String>,
    /// Project context shown to every condition (structure, conventions).
    #[serde(default)]
    pub baseline_context: Option<String>,
    /// Notes on what a correct change looks like.
    #[serde(default)]
    pub expected_changes: Vec<String>,
    #[serde(default)]
    pub difficulty: Option<Difficulty>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub patch_format: PatchFormat,
    /// Tests that measure this task.
    pub validation: TestSelector,
}

/// On-disk task file: one per repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFile {
    pub tasks: Vec<TaskDefinition>,
}

impl TaskFile {
    /// Parses and validates a task file, resolving selector paths against `tests_dir`.
    ///
    /// Every problem is collected; any problem fails the whole file.
    pub fn parse(content: &str, path: &Path, tests_dir: &Path) -> Result<Vec<TaskDefinition>> {
        let file: TaskFile =
            serde_yaml::from_str(content).map_err(|e| Error::MalformedTaskFile {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let problems = Self::problems(&file.tasks);
        if !problems.is_empty() {
            return Err(Error::MalformedTaskFile {
                path: path.to_path_buf(),
                reason: problems.join("; "),
            });
        }

        let mut tasks = file.tasks;
        for task in &mut tasks {
            task.validation.resolve(tests_dir);
        }
        Ok(tasks)
    }

    fn problems(tasks: &[TaskDefinition]) -> Vec<String> {
        let mut problems = Vec::new();
        let mut seen = HashSet::new();

        for (index, task) in tasks.iter().enumerate() {
            let label = if task.id.trim().is_empty() {
                format!("task #{}", index + 1)
            } else {
                format!("task '{}'", task.id)
            };

            if task.id.trim().is_empty() {
                problems.push(format!("{}: id cannot be empty", label));
            } else if !seen.insert(task.id.as_str()) {
                problems.push(format!("{}: duplicate id", label));
            }
            if task.name.trim().is_empty() {
                problems.push(format!("{}: name cannot be empty", label));
            }
            if task.description.trim().is_empty() {
                problems.push(format!("{}: description cannot be empty", label));
            }
            if task.target_files.is_empty() {
                problems.push(format!("{}: target_files cannot be empty", label));
            }
        }

        problems
    }

    /// Loads a repository's task file from disk.
    pub fn load(repo: &Repo) -> Result<Vec<TaskDefinition>> {
        let content =
            std::fs::read_to_string(&repo.tasks_file).map_err(|e| Error::MalformedTaskFile {
                path: repo.tasks_file.clone(),
                reason: e.to_string(),
            })?;
        let tasks = Self::parse(&content, &repo.tasks_file, &repo.tests_dir)?;

        tracing::debug!(
            repo = %repo.name,
            count = tasks.len(),
            path = ?repo.tasks_file,
            "loaded task definitions"
        );
        Ok(tasks)
    }
}

/// Loaded task definitions, keyed by repository, in file order.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<String, Vec<TaskDefinition>>,
}

impl TaskRegistry {
    /// Loads the task files for the named repositories.
    pub fn load(repos: &RepoRegistry, names: &[String]) -> Result<Self> {
        let mut registry = TaskRegistry::default();
        for name in names {
            let repo = repos.get(name)?;
            registry.insert(name.clone(), TaskFile::load(repo)?);
        }
        Ok(registry)
    }

    /// Registers already-parsed tasks for a repository.
    pub fn insert(&mut self, repo: impl Into<String>, tasks: Vec<TaskDefinition>) {
        self.tasks.insert(repo.into(), tasks);
    }

    /// Tasks for a repository, in file order.
    pub fn tasks(&self, repo: &str) -> Result<&[TaskDefinition]> {
        self.tasks
            .get(repo)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::UnknownRepo(repo.to_string()))
    }

    /// Looks up a single task.
    pub fn get(&self, repo: &str, task_id: &str) -> Result<&TaskDefinition> {
        self.tasks(repo)?
            .iter()
            .find(|t| t.id == task_id)
            .ok_or_else(|| Error::UnknownTask {
                repo: repo.to_string(),
                task_id: task_id.to_string(),
            })
    }

    /// Task ids for a repository, in file order.
    pub fn ids(&self, repo: &str) -> Result<Vec<&str>> {
        Ok(self.tasks(repo)?.iter().map(|t| t.id.as_str()).collect())
    }

    /// Selects tasks by id, preserving file order. `None` selects every task.
    ///
    /// Ids that do not exist in the repository fail rather than being skipped.
    pub fn select(&self, repo: &str, ids: Option<&[String]>) -> Result<Vec<&TaskDefinition>> {
        let tasks = self.tasks(repo)?;
        let Some(ids) = ids else {
            return Ok(tasks.iter().collect());
        };

        for id in ids {
            self.get(repo, id)?;
        }
        Ok(tasks.iter().filter(|t| ids.contains(&t.id)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TASKS: &str = r#"
tasks:
  - id: missing-item-404
    name: Return 404 for missing items
    description: GET /items/{id} must return 404 with an error body.
    target_files: [app/api/routes/items.py]
    difficulty: easy
    validation:
      files: [test_aspect_bench_error_schema.py]
      marker: aspect_bench
  - id: paginated-items-endpoint
    name: Paginate the items endpoint
    description: Add skip/limit pagination metadata.
    target_files: [app/api/routes/items.py, app/models.py]
    patch_format: diff
    expected_changes:
      - Response includes a total count
    validation: {}
"#;

    fn parse(content: &str) -> Result<Vec<TaskDefinition>> {
        TaskFile::parse(content, Path::new("tasks.yaml"), Path::new("/bench/tests"))
    }

    #[test]
    fn parses_tasks_in_file_order() {
        let tasks = parse(TASKS).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, "missing-item-404");
        assert_eq!(tasks[0].difficulty, Some(Difficulty::Easy));
        assert_eq!(tasks[0].patch_format, PatchFormat::FullFile);
        assert_eq!(tasks[1].patch_format, PatchFormat::Diff);
        assert_eq!(tasks[1].expected_changes.len(), 1);
    }

    #[test]
    fn resolves_selector_paths_against_tests_dir() {
        let tasks = parse(TASKS).unwrap();
        assert_eq!(
            tasks[0].validation.files,
            vec![PathBuf::from("/bench/tests/test_aspect_bench_error_schema.py")]
        );
        assert_eq!(tasks[0].validation.marker.as_deref(), Some("aspect_bench"));
        assert!(tasks[1].validation.is_all());
    }

    #[test]
    fn duplicate_ids_fail_fast() {
        let yaml = r#"
tasks:
  - {id: a, name: A, description: d, target_files: [x.py], validation: {}}
  - {id: a, name: B, description: d, target_files: [y.py], validation: {}}
"#;
        let err = parse(yaml).unwrap_err();
        assert!(matches!(&err, Error::MalformedTaskFile { reason, .. } if reason.contains("duplicate")));
    }

    #[test]
    fn empty_target_files_fail() {
        let yaml = r#"
tasks:
  - {id: a, name: A, description: d, target_files: [], validation: {}}
"#;
        let err = parse(yaml).unwrap_err();
        assert!(err.to_string().contains("target_files"));
    }

    #[test]
    fn missing_required_field_fails() {
        let yaml = r#"
tasks:
  - {id: a, description: d, target_files: [x.py], validation: {}}
"#;
        assert!(matches!(parse(yaml), Err(Error::MalformedTaskFile { .. })));
    }

    #[test]
    fn collects_every_problem() {
        let yaml = r#"
tasks:
  - {id: "", name: "", description: d, target_files: [x.py], validation: {}}
  - {id: b, name: B, description: " ", target_files: [], validation: {}}
"#;
        let err = parse(yaml).unwrap_err().to_string();
        assert!(err.contains("id cannot be empty"));
        assert!(err.contains("name cannot be empty"));
        assert!(err.contains("description cannot be empty"));
        assert!(err.contains("target_files"));
    }

    #[test]
    fn registry_get_and_select() {
        let mut registry = TaskRegistry::default();
        registry.insert("fastapi-template", parse(TASKS).unwrap());

        assert_eq!(
            registry.get("fastapi-template", "missing-item-404").unwrap().name,
            "Return 404 for missing items"
        );
        assert!(matches!(
            registry.get("fastapi-template", "nope"),
            Err(Error::UnknownTask { .. })
        ));
        assert!(matches!(
            registry.tasks("djangopackages"),
            Err(Error::UnknownRepo(_))
        ));

        let ids = vec!["paginated-items-endpoint".to_string()];
        let selected = registry.select("fastapi-template", Some(&ids)).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, "paginated-items-endpoint");

        let all = registry.select("fastapi-template", None).unwrap();
        assert_eq!(all.len(), 2);

        let unknown = vec!["ghost".to_string()];
        assert!(registry.select("fastapi-template", Some(&unknown)).is_err());
    }

    #[test]
    fn load_reports_missing_file_as_malformed() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = RepoRegistry::new(
            &super::super::RepoConfig::defaults(),
            dir.path(),
            dir.path(),
            dir.path(),
        )
        .unwrap();
        let repo = registry.get("djangopackages").unwrap();
        assert!(matches!(
            TaskFile::load(repo),
            Err(Error::MalformedTaskFile { .. })
        ));
    }
}
