//! Regression analysis.
//!
//! Compares pre- and post-change test outcomes and aggregates trials per
//! (repository, condition). Classification never looks at the condition
//! that produced a trial.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::prompt::Condition;
use crate::suite::TestOutcome;
use crate::trial::{FailureReason, TrialResult, TrialStatus};

/// Net effect of a change on the selected tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// At least one test fixed, none broken.
    Improved,
    /// Some tests fixed and some broken.
    Mixed,
    /// Tests broken, none fixed.
    Regressed,
    /// Nothing changed state.
    NoEffect,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Improved => "improved",
            Verdict::Mixed => "mixed",
            Verdict::Regressed => "regressed",
            Verdict::NoEffect => "no_effect",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed and broken tests between two outcomes, with the resulting verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub fixed: BTreeSet<String>,
    pub broken: BTreeSet<String>,
    pub verdict: Verdict,
}

/// Tests not passing before and passing after.
pub fn fixed(pre: &TestOutcome, post: &TestOutcome) -> BTreeSet<String> {
    pre.not_passing()
        .into_iter()
        .filter(|id| post.passed.contains(*id))
        .cloned()
        .collect()
}

/// Tests passing before and failing or erroring after.
///
/// A test that stays failing (even with a different error) is unchanged.
pub fn broken(pre: &TestOutcome, post: &TestOutcome) -> BTreeSet<String> {
    pre.passed
        .iter()
        .filter(|id| post.failed.contains(*id) || post.errored.contains(*id))
        .cloned()
        .collect()
}

/// Classifies a pair of outcomes.
pub fn classify(pre: &TestOutcome, post: &TestOutcome) -> Verdict {
    compare(pre, post).verdict
}

pub fn compare(pre: &TestOutcome, post: &TestOutcome) -> Comparison {
    let fixed = fixed(pre, post);
    let broken = broken(pre, post);
    let verdict = match (fixed.is_empty(), broken.is_empty()) {
        (false, true) => Verdict::Improved,
        (false, false) => Verdict::Mixed,
        (true, false) => Verdict::Regressed,
        (true, true) => Verdict::NoEffect,
    };
    Comparison {
        fixed,
        broken,
        verdict,
    }
}

/// Aggregate of every trial for one (repository, condition).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub repo: String,
    pub condition: Option<Condition>,
    /// Terminal trials, succeeded or failed.
    pub tasks_attempted: usize,
    /// Succeeded trials whose post-change outcome is fully green.
    pub tasks_passed: usize,
    /// Succeeded trials that fixed at least one test.
    pub tasks_with_improved_tests: usize,
    pub tests_fixed_total: usize,
    pub tests_broken_total: usize,
    /// Succeeded trials that broke at least one test.
    pub regression_count: usize,
    pub failed: usize,
    pub verdicts: BTreeMap<Verdict, usize>,
    pub failures: BTreeMap<FailureReason, usize>,
}

impl ExperimentSummary {
    fn add(&mut self, trial: &TrialResult) {
        match trial.status {
            TrialStatus::Succeeded => {
                self.tasks_attempted += 1;
                if trial.post_test_outcome.as_ref().is_some_and(TestOutcome::is_green) {
                    self.tasks_passed += 1;
                }
                if !trial.fixed.is_empty() {
                    self.tasks_with_improved_tests += 1;
                }
                if !trial.broken.is_empty() {
                    self.regression_count += 1;
                }
                self.tests_fixed_total += trial.fixed.len();
                self.tests_broken_total += trial.broken.len();
                if let Some(verdict) = trial.verdict {
                    *self.verdicts.entry(verdict).or_default() += 1;
                }
            }
            TrialStatus::Failed => {
                self.tasks_attempted += 1;
                self.failed += 1;
                if let Some(reason) = trial.failure_reason() {
                    *self.failures.entry(reason).or_default() += 1;
                }
            }
            TrialStatus::Pending | TrialStatus::Running => {}
        }
    }
}

/// Aggregates trials per (repository, condition), sorted by key.
///
/// Pure reduction: calling it twice on the same trials yields the same summaries.
pub fn summarize(trials: &[TrialResult]) -> Vec<ExperimentSummary> {
    let mut groups: BTreeMap<(String, Condition), ExperimentSummary> = BTreeMap::new();

    for trial in trials.iter().filter(|t| t.is_terminal()) {
        groups
            .entry((trial.repo.clone(), trial.condition))
            .or_insert_with(|| ExperimentSummary {
                repo: trial.repo.clone(),
                condition: Some(trial.condition),
                ..ExperimentSummary::default()
            })
            .add(trial);
    }

    groups.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::TestStatus::{self, Errored as E, Failed as F, Passed as P};
    use crate::trial::TrialKey;

    fn outcome(entries: &[(&str, TestStatus)]) -> TestOutcome {
        let mut outcome = TestOutcome::new();
        for (id, status) in entries {
            outcome.record(*id, *status);
        }
        outcome
    }

    #[test]
    fn missing_item_fix_is_improved() {
        let pre = outcome(&[("test_404", F), ("test_list", P)]);
        let post = outcome(&[("test_404", P), ("test_list", P)]);

        let comparison = compare(&pre, &post);
        assert_eq!(comparison.verdict, Verdict::Improved);
        assert_eq!(comparison.fixed.len(), 1);
        assert!(comparison.broken.is_empty());
    }

    #[test]
    fn errored_to_passed_counts_as_fixed() {
        let pre = outcome(&[("a", E)]);
        let post = outcome(&[("a", P)]);
        assert_eq!(fixed(&pre, &post).len(), 1);
    }

    #[test]
    fn each_bucket_is_reachable() {
        let pre = outcome(&[("a", F), ("b", P)]);
        assert_eq!(classify(&pre, &outcome(&[("a", P), ("b", F)])), Verdict::Mixed);
        assert_eq!(classify(&pre, &outcome(&[("a", F), ("b", E)])), Verdict::Regressed);
        assert_eq!(classify(&pre, &pre), Verdict::NoEffect);
    }

    #[test]
    fn failing_with_different_error_is_unchanged() {
        let pre = outcome(&[("a", F), ("b", E)]);
        let post = outcome(&[("a", E), ("b", F)]);
        let comparison = compare(&pre, &post);
        assert!(comparison.fixed.is_empty());
        assert!(comparison.broken.is_empty());
        assert_eq!(comparison.verdict, Verdict::NoEffect);
    }

    #[test]
    fn new_tests_are_neither_fixed_nor_broken() {
        let pre = outcome(&[("a", P)]);
        let post = outcome(&[("a", P), ("new_failing", F)]);
        assert_eq!(classify(&pre, &post), Verdict::NoEffect);
    }

    #[test]
    fn fixed_count_matches_set_definition_exhaustively() {
        let statuses = [None, Some(P), Some(F), Some(E)];
        for a_pre in statuses {
            for a_post in statuses {
                for b_pre in statuses {
                    for b_post in statuses {
                        let mut pre = TestOutcome::new();
                        let mut post = TestOutcome::new();
                        for (id, s) in [("a", a_pre), ("b", b_pre)] {
                            if let Some(s) = s {
                                pre.record(id, s);
                            }
                        }
                        for (id, s) in [("a", a_post), ("b", b_post)] {
                            if let Some(s) = s {
                                post.record(id, s);
                            }
                        }

                        let expected_fixed = pre
                            .failed
                            .union(&pre.errored)
                            .filter(|id| post.passed.contains(*id))
                            .count();
                        let comparison = compare(&pre, &post);
                        assert_eq!(comparison.fixed.len(), expected_fixed);

                        let expected = match (comparison.fixed.len(), comparison.broken.len()) {
                            (0, 0) => Verdict::NoEffect,
                            (0, _) => Verdict::Regressed,
                            (_, 0) => Verdict::Improved,
                            _ => Verdict::Mixed,
                        };
                        assert_eq!(comparison.verdict, expected);
                    }
                }
            }
        }
    }

    fn succeeded(repo: &str, condition: Condition, fixed: &[&str], broken: &[&str], green: bool) -> TrialResult {
        let key = TrialKey::new(repo, format!("task-{}", fixed.len() + broken.len()), condition);
        let mut trial = TrialResult::new("exp", &key, "fake", "model");
        trial.status = TrialStatus::Succeeded;
        trial.fixed = fixed.iter().map(|s| s.to_string()).collect();
        trial.broken = broken.iter().map(|s| s.to_string()).collect();
        let post = if green {
            outcome(&[("ok", P)])
        } else {
            outcome(&[("ok", P), ("bad", F)])
        };
        trial.post_test_outcome = Some(post);
        trial.verdict = Some(match (fixed.is_empty(), broken.is_empty()) {
            (false, true) => Verdict::Improved,
            (false, false) => Verdict::Mixed,
            (true, false) => Verdict::Regressed,
            (true, true) => Verdict::NoEffect,
        });
        trial
    }

    #[test]
    fn summarize_groups_by_repo_and_condition() {
        let mut failed = TrialResult::new(
            "exp",
            &TrialKey::new("fastapi-template", "t9", Condition::Swapped),
            "fake",
            "model",
        );
        failed.fail(FailureReason::PatchApplyFailed, "missing dir");
        let pending = TrialResult::new(
            "exp",
            &TrialKey::new("fastapi-template", "t10", Condition::Baseline),
            "fake",
            "model",
        );

        let trials = vec![
            succeeded("fastapi-template", Condition::Baseline, &["t1"], &[], true),
            succeeded("fastapi-template", Condition::Baseline, &["t2", "t3"], &["t4"], false),
            succeeded("fastapi-template", Condition::AspectKb, &[], &[], true),
            failed,
            pending,
        ];

        let summaries = summarize(&trials);
        assert_eq!(summaries.len(), 3);

        let baseline = &summaries[0];
        assert_eq!(baseline.condition, Some(Condition::Baseline));
        assert_eq!(baseline.tasks_attempted, 2);
        assert_eq!(baseline.tasks_passed, 1);
        assert_eq!(baseline.tasks_with_improved_tests, 2);
        assert_eq!(baseline.tests_fixed_total, 3);
        assert_eq!(baseline.tests_broken_total, 1);
        assert_eq!(baseline.regression_count, 1);
        assert_eq!(baseline.verdicts.get(&Verdict::Mixed), Some(&1));

        let swapped = summaries
            .iter()
            .find(|s| s.condition == Some(Condition::Swapped))
            .unwrap();
        assert_eq!(swapped.tasks_attempted, 1);
        assert_eq!(swapped.failed, 1);
        assert_eq!(swapped.failures.get(&FailureReason::PatchApplyFailed), Some(&1));

        assert_eq!(summarize(&trials), summaries);
    }
}
