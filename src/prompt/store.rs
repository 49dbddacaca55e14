//! On-disk persistence of compiled prompts.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::compiler::Prompt;
use super::condition::Condition;

/// Sidecar metadata stored next to each prompt text.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PromptMeta {
    repo: String,
    task_id: String,
    condition: Condition,
    kb_source: Option<String>,
    generated_at: chrono::DateTime<Utc>,
    bytes: usize,
}

/// Persists prompts keyed by (repo, task_id, condition).
#[derive(Debug, Clone)]
pub struct PromptStore {
    root: PathBuf,
}

impl PromptStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the prompt text for a key.
    pub fn text_path(&self, repo: &str, task_id: &str, condition: Condition) -> PathBuf {
        self.root
            .join(repo)
            .join(format!("{}_{}.txt", task_id, condition))
    }

    fn meta_path(&self, repo: &str, task_id: &str, condition: Condition) -> PathBuf {
        self.root
            .join(repo)
            .join(format!("{}_{}.json", task_id, condition))
    }

    /// Writes a prompt, stamping `generated_at`.
    ///
    /// An already persisted prompt with identical text is left untouched and
    /// its original timestamp returned.
    pub fn save(&self, prompt: &Prompt) -> Result<Prompt> {
        if let Some(existing) = self.load(&prompt.repo, &prompt.task_id, prompt.condition)? {
            if existing.compiled_text == prompt.compiled_text {
                return Ok(existing);
            }
            tracing::warn!(
                repo = %prompt.repo,
                task_id = %prompt.task_id,
                condition = %prompt.condition,
                "persisted prompt differs from fresh compilation, overwriting"
            );
        }

        let text_path = self.text_path(&prompt.repo, &prompt.task_id, prompt.condition);
        if let Some(parent) = text_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let generated_at = Utc::now();
        let meta = PromptMeta {
            repo: prompt.repo.clone(),
            task_id: prompt.task_id.clone(),
            condition: prompt.condition,
            kb_source: prompt.kb_source.clone(),
            generated_at,
            bytes: prompt.compiled_text.len(),
        };

        std::fs::write(&text_path, &prompt.compiled_text)?;
        std::fs::write(
            self.meta_path(&prompt.repo, &prompt.task_id, prompt.condition),
            serde_json::to_string_pretty(&meta)?,
        )?;

        tracing::debug!(path = ?text_path, "persisted prompt");

        Ok(Prompt {
            generated_at: Some(generated_at),
            ..prompt.clone()
        })
    }

    /// Reads a persisted prompt, if present.
    pub fn load(&self, repo: &str, task_id: &str, condition: Condition) -> Result<Option<Prompt>> {
        let text_path = self.text_path(repo, task_id, condition);
        if !text_path.exists() {
            return Ok(None);
        }

        let compiled_text = std::fs::read_to_string(&text_path)?;
        let meta_path = self.meta_path(repo, task_id, condition);
        let meta: Option<PromptMeta> = if meta_path.exists() {
            Some(serde_json::from_str(&std::fs::read_to_string(&meta_path)?)?)
        } else {
            None
        };

        Ok(Some(Prompt {
            repo: repo.to_string(),
            task_id: task_id.to_string(),
            condition,
            kb_source: meta.as_ref().and_then(|m| m.kb_source.clone()),
            compiled_text,
            generated_at: meta.map(|m| m.generated_at),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn prompt(text: &str) -> Prompt {
        Prompt {
            repo: "fastapi-template".to_string(),
            task_id: "missing-item-404".to_string(),
            condition: Condition::Swapped,
            kb_source: Some("djangopackages".to_string()),
            compiled_text: text.to_string(),
            generated_at: None,
        }
    }

    #[test]
    fn save_then_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = PromptStore::new(dir.path());

        let saved = store.save(&prompt("hello")).unwrap();
        assert!(saved.generated_at.is_some());
        assert!(dir
            .path()
            .join("fastapi-template/missing-item-404_swapped.txt")
            .exists());

        let loaded = store
            .load("fastapi-template", "missing-item-404", Condition::Swapped)
            .unwrap()
            .unwrap();
        assert_eq!(loaded, saved);
    }

    #[test]
    fn identical_resave_keeps_timestamp() {
        let dir = TempDir::new().unwrap();
        let store = PromptStore::new(dir.path());

        let first = store.save(&prompt("same")).unwrap();
        let second = store.save(&prompt("same")).unwrap();
        assert_eq!(first.generated_at, second.generated_at);
    }

    #[test]
    fn changed_prompt_is_overwritten() {
        let dir = TempDir::new().unwrap();
        let store = PromptStore::new(dir.path());

        store.save(&prompt("old")).unwrap();
        store.save(&prompt("new")).unwrap();
        let loaded = store
            .load("fastapi-template", "missing-item-404", Condition::Swapped)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.compiled_text, "new");
    }

    #[test]
    fn missing_prompt_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = PromptStore::new(dir.path());
        assert!(store
            .load("fastapi-template", "nope", Condition::Baseline)
            .unwrap()
            .is_none());
    }
}
