//! Test outcomes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Result of a single test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    Errored,
}

/// Outcome of one test-suite run.
///
/// The three sets are disjoint. When a test is reported more than once
/// (e.g. it passed but its teardown errored) the worst status wins:
/// errored over failed over passed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    #[serde(default)]
    pub passed: BTreeSet<String>,
    #[serde(default)]
    pub failed: BTreeSet<String>,
    #[serde(default)]
    pub errored: BTreeSet<String>,
}

impl TestOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a test result, keeping the sets disjoint.
    pub fn record(&mut self, id: impl Into<String>, status: TestStatus) {
        let id = id.into();
        match self.status(&id) {
            Some(existing) if existing >= status => return,
            Some(TestStatus::Passed) => {
                self.passed.remove(&id);
            }
            Some(TestStatus::Failed) => {
                self.failed.remove(&id);
            }
            _ => {}
        }

        match status {
            TestStatus::Passed => self.passed.insert(id),
            TestStatus::Failed => self.failed.insert(id),
            TestStatus::Errored => self.errored.insert(id),
        };
    }

    /// Status of a test, if it was part of the run.
    pub fn status(&self, id: &str) -> Option<TestStatus> {
        if self.errored.contains(id) {
            Some(TestStatus::Errored)
        } else if self.failed.contains(id) {
            Some(TestStatus::Failed)
        } else if self.passed.contains(id) {
            Some(TestStatus::Passed)
        } else {
            None
        }
    }

    /// Folds another run's results into this one.
    pub fn merge(&mut self, other: TestOutcome) {
        for id in other.passed {
            self.record(id, TestStatus::Passed);
        }
        for id in other.failed {
            self.record(id, TestStatus::Failed);
        }
        for id in other.errored {
            self.record(id, TestStatus::Errored);
        }
    }

    /// Marks tests present in `pre` but missing from this outcome as errored.
    ///
    /// A patch that breaks imports can make tests vanish from collection;
    /// they count against the patch rather than dropping out of the universe.
    pub fn reconcile(&mut self, pre: &TestOutcome) {
        let missing: Vec<String> = pre
            .all()
            .filter(|id| self.status(id).is_none())
            .cloned()
            .collect();
        for id in missing {
            self.errored.insert(id);
        }
    }

    /// Every test id in the outcome, in order.
    pub fn all(&self) -> impl Iterator<Item = &String> {
        let mut ids: Vec<&String> = self
            .passed
            .iter()
            .chain(self.failed.iter())
            .chain(self.errored.iter())
            .collect();
        ids.sort();
        ids.into_iter()
    }

    pub fn len(&self) -> usize {
        self.passed.len() + self.failed.len() + self.errored.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when at least one test ran and none failed or errored.
    pub fn is_green(&self) -> bool {
        !self.passed.is_empty() && self.failed.is_empty() && self.errored.is_empty()
    }

    /// Tests that did not pass.
    pub fn not_passing(&self) -> BTreeSet<&String> {
        self.failed.iter().chain(self.errored.iter()).collect()
    }
}
