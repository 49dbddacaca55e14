//! Test-suite execution.
//!
//! A [`TestRunner`] runs a task's test selector inside a workspace and
//! reports a [`TestOutcome`]. Failing tests are a normal outcome; only a
//! runner that cannot produce results returns an error.

mod outcome;
mod pytest;

pub use outcome::{TestOutcome, TestStatus};
pub use pytest::{parse_report, PytestRunner};

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::registry::TestSelector;

/// One invocation of the test suite.
#[derive(Debug, Clone)]
pub struct TestRunRequest {
    /// Directory the tests run from (workspace root joined with the backend path).
    pub workdir: PathBuf,
    /// Which tests to run.
    pub selector: TestSelector,
    /// Upper bound for the whole invocation.
    pub timeout: Duration,
}

/// Trait for test runners.
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Runs the selected tests and reports their outcome.
    ///
    /// Must leave no state behind outside `request.workdir`.
    async fn run(&self, request: &TestRunRequest) -> Result<TestOutcome>;

    /// Returns the name of this runner.
    fn name(&self) -> &str;
}
