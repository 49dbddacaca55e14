//! Markdown rendering of stored experiments.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::Path;

use crate::error::Result;
use crate::prompt::Condition;
use crate::store::ExperimentRecord;
use crate::trial::{TrialResult, TrialStatus};

/// Longest failure detail shown before truncation.
const MAX_DETAIL: usize = 200;

/// Renders an experiment record as a markdown report.
pub fn render(record: &ExperimentRecord) -> String {
    let mut out = String::new();
    header(&mut out, record);
    headline(&mut out, record);
    matrix(&mut out, &record.trials);
    failures(&mut out, &record.trials);
    out
}

/// Renders `record` and writes it to `path`, creating parent directories.
pub fn write(record: &ExperimentRecord, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, render(record))?;
    tracing::info!(path = ?path, "wrote report");
    Ok(())
}

fn header(out: &mut String, record: &ExperimentRecord) {
    let _ = writeln!(out, "# Aspect Bench Report\n");
    match &record.manifest {
        Some(m) => {
            let _ = writeln!(out, "- **Experiment:** {}", m.experiment_id);
            let _ = writeln!(out, "- **Provider:** {}", m.provider);
            let _ = writeln!(out, "- **Model:** {}", m.model);
            let _ = writeln!(out, "- **Temperature:** {}", m.temperature);
            let _ = writeln!(out, "- **Started:** {}", m.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        None => {
            let id = record
                .trials
                .first()
                .map(|t| t.experiment_id.as_str())
                .unwrap_or("unknown");
            let _ = writeln!(out, "- **Experiment:** {}", id);
        }
    }
    let _ = writeln!(out, "- **Trials:** {}\n", record.trials.len());
}

fn headline(out: &mut String, record: &ExperimentRecord) {
    let _ = writeln!(out, "## Results by Condition\n");
    if record.summary.is_empty() {
        let _ = writeln!(out, "No completed trials.\n");
        return;
    }

    let _ = writeln!(
        out,
        "| Repo | Condition | Tasks Attempted | Tasks Passed | Tasks Improved | Tests Fixed | Tests Broken | Regressions | Failed |"
    );
    let _ = writeln!(out, "|---|---|---:|---:|---:|---:|---:|---:|---:|");
    for s in &record.summary {
        let condition = s.condition.map(Condition::as_str).unwrap_or("all");
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} | {} | {} | {} | {} | {} |",
            table_text(&s.repo),
            condition,
            s.tasks_attempted,
            s.tasks_passed,
            s.tasks_with_improved_tests,
            s.tests_fixed_total,
            s.tests_broken_total,
            s.regression_count,
            s.failed
        );
    }
    out.push('\n');
}

fn cell(trial: &TrialResult) -> String {
    match trial.status {
        TrialStatus::Succeeded => {
            let verdict = trial.verdict.map(|v| v.as_str()).unwrap_or("?");
            format!("{} (+{}/-{})", verdict, trial.fixed.len(), trial.broken.len())
        }
        TrialStatus::Failed => match trial.failure_reason() {
            Some(reason) => format!("failed: {}", reason),
            None => "failed".to_string(),
        },
        TrialStatus::Pending | TrialStatus::Running => "incomplete".to_string(),
    }
}

fn matrix(out: &mut String, trials: &[TrialResult]) {
    let _ = writeln!(out, "## Verdicts by Task\n");
    if trials.is_empty() {
        let _ = writeln!(out, "No trials recorded.\n");
        return;
    }

    let conditions: BTreeSet<Condition> = trials.iter().map(|t| t.condition).collect();
    let mut rows: BTreeMap<(&str, &str), BTreeMap<Condition, String>> = BTreeMap::new();
    for trial in trials {
        rows.entry((trial.repo.as_str(), trial.task_id.as_str()))
            .or_default()
            .insert(trial.condition, cell(trial));
    }

    let _ = write!(out, "| Repo | Task |");
    for c in &conditions {
        let _ = write!(out, " {} |", c);
    }
    let _ = write!(out, "\n|---|---|");
    for _ in &conditions {
        out.push_str("---|");
    }
    out.push('\n');

    for ((repo, task), cells) in &rows {
        let _ = write!(out, "| {} | {} |", table_text(repo), table_text(task));
        for c in &conditions {
            let _ = write!(out, " {} |", cells.get(c).map(String::as_str).unwrap_or("-"));
        }
        out.push('\n');
    }
    out.push('\n');
}

fn failures(out: &mut String, trials: &[TrialResult]) {
    let failed: Vec<&TrialResult> = trials
        .iter()
        .filter(|t| t.status == TrialStatus::Failed)
        .collect();
    if failed.is_empty() {
        return;
    }

    let _ = writeln!(out, "## Failures\n");
    for trial in failed {
        let (reason, detail) = match &trial.failure {
            Some(f) => (f.reason.as_str(), f.detail.as_str()),
            None => ("unknown", ""),
        };
        let _ = writeln!(
            out,
            "- `{}` **{}**: {}",
            trial.key(),
            reason,
            one_line(detail)
        );
    }
    out.push('\n');
}

/// Escapes characters that would split a markdown table cell.
fn table_text(text: &str) -> String {
    text.replace('|', "\\|")
}

fn one_line(detail: &str) -> String {
    let flat = detail.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= MAX_DETAIL {
        return flat;
    }
    let mut cut: String = flat.chars().take(MAX_DETAIL).collect();
    cut.push_str("...");
    cut
}
