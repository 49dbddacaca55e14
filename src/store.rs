//! Experiment store.
//!
//! Layout under `<results_dir>/<experiment_id>/`:
//!
//! - `manifest.json`: run parameters, written once at start
//! - `trials.jsonl`: one terminal [`TrialResult`] per line, append-only
//! - `responses/`: raw model output per trial
//! - `experiment.json`: manifest, trials and summaries, rewritten on finalize
//!
//! `trials.jsonl` is the source of truth; everything else is derived.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::{summarize, ExperimentSummary};
use crate::error::{Error, Result};
use crate::prompt::Condition;
use crate::trial::{TrialKey, TrialResult};

const MANIFEST_FILE: &str = "manifest.json";
const TRIALS_FILE: &str = "trials.jsonl";
const EXPERIMENT_FILE: &str = "experiment.json";
const RESPONSES_DIR: &str = "responses";

/// Fresh experiment id from the current UTC time.
pub fn new_experiment_id() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

fn validate_experiment_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid experiment id '{}'", id)))
    }
}

/// Parameters of a run, recorded once when it starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub experiment_id: String,
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub repos: Vec<String>,
    pub conditions: Vec<Condition>,
    /// Explicit task selection, if any.
    #[serde(default)]
    pub tasks: Option<Vec<String>>,
    pub started_at: DateTime<Utc>,
}

/// Complete experiment document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub manifest: Option<Manifest>,
    pub trials: Vec<TrialResult>,
    pub summary: Vec<ExperimentSummary>,
    pub written_at: DateTime<Utc>,
}

/// Durable trial storage for one experiment id.
#[derive(Debug)]
pub struct ExperimentStore {
    id: String,
    dir: PathBuf,
    append_lock: Mutex<()>,
}

impl ExperimentStore {
    /// Opens (creating if needed) the store for `id` under `results_dir`.
    pub fn open(results_dir: &Path, id: &str) -> Result<Self> {
        validate_experiment_id(id)?;
        let dir = results_dir.join(id);
        std::fs::create_dir_all(dir.join(RESPONSES_DIR))?;
        Ok(Self {
            id: id.to_string(),
            dir,
            append_lock: Mutex::new(()),
        })
    }

    /// Opens an existing experiment, failing if it was never created.
    pub fn open_existing(results_dir: &Path, id: &str) -> Result<Self> {
        validate_experiment_id(id)?;
        let dir = results_dir.join(id);
        if !dir.join(TRIALS_FILE).exists() && !dir.join(MANIFEST_FILE).exists() {
            return Err(Error::Config(format!(
                "no experiment '{}' in {}",
                id,
                results_dir.display()
            )));
        }
        Self::open(results_dir, id)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Appends one terminal trial as a single JSON line.
    ///
    /// Safe to call from concurrent trials; each call writes exactly one line.
    pub fn append(&self, trial: &TrialResult) -> Result<()> {
        if trial.experiment_id != self.id {
            return Err(Error::Store(format!(
                "trial {} belongs to experiment '{}', not '{}'",
                trial.key(),
                trial.experiment_id,
                self.id
            )));
        }
        if !trial.is_terminal() {
            return Err(Error::Store(format!(
                "trial {} is not terminal and cannot be stored",
                trial.key()
            )));
        }

        let mut line = serde_json::to_string(trial)?;
        line.push('\n');

        let _guard = self
            .append_lock
            .lock()
            .map_err(|_| Error::Store("trial log lock poisoned".to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(TRIALS_FILE))?;
        file.write_all(line.as_bytes())?;
        file.flush()?;

        tracing::debug!(experiment = %self.id, trial = %trial.key(), "stored trial");
        Ok(())
    }

    /// Loads stored trials, keeping the first record per key.
    ///
    /// A torn final line (interrupted write) is skipped with a warning.
    pub fn load(&self) -> Result<Vec<TrialResult>> {
        let path = self.dir.join(TRIALS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut seen = BTreeSet::new();
        let mut trials = Vec::with_capacity(lines.len());

        for (index, line) in lines.iter().enumerate() {
            let trial: TrialResult = match serde_json::from_str(line) {
                Ok(trial) => trial,
                Err(e) if index + 1 == lines.len() => {
                    tracing::warn!(path = ?path, error = %e, "skipping truncated final trial record");
                    continue;
                }
                Err(e) => {
                    return Err(Error::Store(format!(
                        "{} line {}: {}",
                        path.display(),
                        index + 1,
                        e
                    )))
                }
            };

            if seen.insert(trial.key()) {
                trials.push(trial);
            } else {
                tracing::warn!(trial = %trial.key(), "duplicate trial record ignored");
            }
        }

        Ok(trials)
    }

    /// Keys with a terminal record.
    pub fn completed(&self) -> Result<BTreeSet<TrialKey>> {
        Ok(self
            .load()?
            .into_iter()
            .filter(TrialResult::is_terminal)
            .map(|t| t.key())
            .collect())
    }

    /// Whether a terminal record exists for `key`.
    pub fn exists(&self, key: &TrialKey) -> Result<bool> {
        Ok(self.completed()?.contains(key))
    }

    /// Path of the raw-response artifact for `key`.
    pub fn response_path(&self, key: &TrialKey) -> PathBuf {
        self.dir.join(RESPONSES_DIR).join(format!(
            "{}_{}_{}_{}.txt",
            key.repo, key.task_id, key.condition, self.id
        ))
    }

    /// Writes the raw model response for `key`.
    pub fn write_response(&self, key: &TrialKey, text: &str) -> Result<PathBuf> {
        let path = self.response_path(key);
        std::fs::write(&path, text)?;
        Ok(path)
    }

    pub fn save_manifest(&self, manifest: &Manifest) -> Result<()> {
        std::fs::write(
            self.dir.join(MANIFEST_FILE),
            serde_json::to_string_pretty(manifest)?,
        )?;
        Ok(())
    }

    pub fn load_manifest(&self) -> Result<Option<Manifest>> {
        let path = self.dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&std::fs::read_to_string(path)?)?))
    }

    /// Builds the experiment document from the trial log.
    pub fn record(&self) -> Result<ExperimentRecord> {
        let trials = self.load()?;
        let summary = summarize(&trials);
        Ok(ExperimentRecord {
            manifest: self.load_manifest()?,
            trials,
            summary,
            written_at: Utc::now(),
        })
    }

    /// Rewrites `experiment.json` from the trial log.
    pub fn finalize(&self) -> Result<ExperimentRecord> {
        let record = self.record()?;
        let path = self.dir.join(EXPERIMENT_FILE);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&record)?)?;
        std::fs::rename(&tmp, &path)?;
        tracing::info!(experiment = %self.id, trials = record.trials.len(), path = ?path, "wrote experiment record");
        Ok(record)
    }
}

/// Experiment ids under `results_dir`, oldest first.
pub fn list_experiments(results_dir: &Path) -> Result<Vec<String>> {
    if !results_dir.exists() {
        return Ok(Vec::new());
    }

    let mut ids = Vec::new();
    for entry in std::fs::read_dir(results_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() && (path.join(TRIALS_FILE).exists() || path.join(MANIFEST_FILE).exists()) {
            ids.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    ids.sort();
    Ok(ids)
}

/// Counts of stored trials per key, for diagnosing duplicate appends.
pub fn record_counts(store: &ExperimentStore) -> Result<BTreeMap<TrialKey, usize>> {
    let path = store.dir.join(TRIALS_FILE);
    let mut counts = BTreeMap::new();
    if !path.exists() {
        return Ok(counts);
    }
    for line in std::fs::read_to_string(path)?.lines() {
        if let Ok(trial) = serde_json::from_str::<TrialResult>(line) {
            *counts.entry(trial.key()).or_insert(0) += 1;
        }
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trial::{FailureReason, TrialStatus};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn trial(id: &str, task: &str, condition: Condition) -> TrialResult {
        let mut trial = TrialResult::new(
            id,
            &TrialKey::new("fastapi-template", task, condition),
            "fake",
            "model",
        );
        trial.status = TrialStatus::Succeeded;
        trial
    }

    #[test]
    fn experiment_id_has_timestamp_shape() {
        let id = new_experiment_id();
        assert_eq!(id.len(), 15);
        assert_eq!(&id[8..9], "_");
        assert!(validate_experiment_id(&id).is_ok());
        assert!(validate_experiment_id("../escape").is_err());
        assert!(validate_experiment_id("").is_err());
    }

    #[test]
    fn append_and_load() {
        let dir = TempDir::new().unwrap();
        let store = ExperimentStore::open(dir.path(), "exp1").unwrap();

        store.append(&trial("exp1", "a", Condition::Baseline)).unwrap();
        store.append(&trial("exp1", "a", Condition::AspectKb)).unwrap();

        let trials = store.load().unwrap();
        assert_eq!(trials.len(), 2);
        assert!(store
            .exists(&TrialKey::new("fastapi-template", "a", Condition::AspectKb))
            .unwrap());
        assert!(!store
            .exists(&TrialKey::new("fastapi-template", "b", Condition::Baseline))
            .unwrap());
    }

    #[test]
    fn rejects_foreign_and_non_terminal_trials() {
        let dir = TempDir::new().unwrap();
        let store = ExperimentStore::open(dir.path(), "exp1").unwrap();

        assert!(matches!(
            store.append(&trial("other", "a", Condition::Baseline)),
            Err(Error::Store(_))
        ));

        let mut pending = trial("exp1", "a", Condition::Baseline);
        pending.status = TrialStatus::Running;
        assert!(matches!(store.append(&pending), Err(Error::Store(_))));
    }

    #[test]
    fn load_keeps_first_duplicate() {
        let dir = TempDir::new().unwrap();
        let store = ExperimentStore::open(dir.path(), "exp1").unwrap();

        let first = trial("exp1", "a", Condition::Baseline);
        let mut second = trial("exp1", "a", Condition::Baseline);
        second.fail(FailureReason::NoPatchExtracted, "later");
        store.append(&first).unwrap();
        store.append(&second).unwrap();

        let trials = store.load().unwrap();
        assert_eq!(trials.len(), 1);
        assert_eq!(trials[0].status, TrialStatus::Succeeded);
    }

    #[test]
    fn truncated_final_line_is_skipped() {
        let dir = TempDir::new().unwrap();
        let store = ExperimentStore::open(dir.path(), "exp1").unwrap();
        store.append(&trial("exp1", "a", Condition::Baseline)).unwrap();

        let mut file = OpenOptions::new()
            .append(true)
            .open(store.dir().join(TRIALS_FILE))
            .unwrap();
        file.write_all(b"{\"experiment_id\":\"exp1\",\"repo\"").unwrap();

        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[test]
    fn concurrent_appends_write_whole_lines() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ExperimentStore::open(dir.path(), "exp1").unwrap());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .append(&trial("exp1", &format!("task-{}", i), Condition::NoKb))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.load().unwrap().len(), 16);
        assert!(record_counts(&store).unwrap().values().all(|&n| n == 1));
    }

    #[test]
    fn response_artifact_name() {
        let dir = TempDir::new().unwrap();
        let store = ExperimentStore::open(dir.path(), "20250101_000000").unwrap();
        let key = TrialKey::new("fastapi-template", "missing-item-404", Condition::Swapped);

        let path = store.write_response(&key, "raw").unwrap();
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            "fastapi-template_missing-item-404_swapped_20250101_000000.txt"
        );
        assert_eq!(std::fs::read_to_string(path).unwrap(), "raw");
    }

    #[test]
    fn finalize_writes_document_and_lists_experiment() {
        let dir = TempDir::new().unwrap();
        let store = ExperimentStore::open(dir.path(), "exp1").unwrap();
        store
            .save_manifest(&Manifest {
                experiment_id: "exp1".to_string(),
                provider: "fake".to_string(),
                model: "model".to_string(),
                temperature: 0.0,
                max_tokens: 100,
                repos: vec!["fastapi-template".to_string()],
                conditions: vec![Condition::Baseline],
                tasks: None,
                started_at: Utc::now(),
            })
            .unwrap();
        store.append(&trial("exp1", "a", Condition::Baseline)).unwrap();

        let record = store.finalize().unwrap();
        assert_eq!(record.trials.len(), 1);
        assert_eq!(record.summary.len(), 1);
        assert!(store.dir().join(EXPERIMENT_FILE).exists());

        let reopened = ExperimentStore::open_existing(dir.path(), "exp1").unwrap();
        assert_eq!(reopened.load_manifest().unwrap().unwrap().model, "model");
        assert_eq!(list_experiments(dir.path()).unwrap(), ["exp1"]);
    }

    #[test]
    fn open_existing_fails_for_unknown_id() {
        let dir = TempDir::new().unwrap();
        assert!(ExperimentStore::open_existing(dir.path(), "nope").is_err());
    }
}
