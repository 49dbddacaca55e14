//! Pytest-backed test runner.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Error, Result};

use super::{TestOutcome, TestRunRequest, TestRunner, TestStatus};

/// Marker used for the side-effect checks in `regression_files`.
const REGRESSION_MARKER: &str = "regression";

/// Environment variable naming the directory the code under test lives in.
///
/// Harness conftests must import the target code from here, never from a
/// fixed checkout path, or the post-change run sees unpatched code.
pub const WORKSPACE_ENV: &str = "ASPECT_BENCH_WORKSPACE";

/// Runs tests with pytest and parses the `-rA` short summary.
#[derive(Debug, Clone)]
pub struct PytestRunner {
    /// Program and leading arguments, e.g. `["pytest"]` or `["python", "-m", "pytest"]`.
    command: Vec<String>,
}

impl Default for PytestRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl PytestRunner {
    pub fn new() -> Self {
        Self {
            command: vec!["pytest".to_string()],
        }
    }

    /// Uses a custom command, e.g. a virtualenv's interpreter.
    pub fn with_command(command: Vec<String>) -> Self {
        Self { command }
    }

    fn build_args(&self, files: &[PathBuf], marker: Option<&str>) -> Vec<String> {
        let mut args: Vec<String> = self.command.iter().skip(1).cloned().collect();
        args.extend(files.iter().map(|f| f.to_string_lossy().into_owned()));
        if let Some(marker) = marker {
            args.push("-m".to_string());
            args.push(marker.to_string());
        }
        args.extend(
            ["-rA", "-q", "-p", "no:cacheprovider"]
                .iter()
                .map(|s| s.to_string()),
        );
        args
    }

    async fn invoke(
        &self,
        workdir: &Path,
        files: &[PathBuf],
        marker: Option<&str>,
        timeout: Duration,
    ) -> Result<TestOutcome> {
        let program = self
            .command
            .first()
            .ok_or_else(|| Error::TestRunner("empty pytest command".to_string()))?;
        let args = self.build_args(files, marker);

        let python_path = python_path(workdir)?;

        tracing::debug!(workdir = ?workdir, args = ?args, "running pytest");

        let child = Command::new(program)
            .args(&args)
            .current_dir(workdir)
            .env(WORKSPACE_ENV, workdir)
            .env("PYTHONPATH", python_path)
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::TestRunner(format!("failed to spawn {}: {}", program, e)))?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::TestRunner(format!("pytest timed out after {:?}", timeout)))?
            .map_err(|e| Error::TestRunner(format!("failed to wait for pytest: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let outcome = parse_report(&stdout);

        match output.status.code() {
            Some(0) | Some(1) | Some(5) => Ok(outcome),
            // Interrupted, usually by collection errors: usable if anything was reported.
            Some(2) if !outcome.is_empty() => Ok(outcome),
            code => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let tail: String = stdout
                    .lines()
                    .rev()
                    .take(5)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect::<Vec<_>>()
                    .join("\n");
                Err(Error::TestRunner(format!(
                    "pytest exited with {}: {}{}",
                    code.map(|c| c.to_string())
                        .unwrap_or_else(|| "a signal".to_string()),
                    stderr.trim(),
                    if tail.is_empty() { String::new() } else { format!("\n{}", tail) }
                )))
            }
        }
    }
}

/// `PYTHONPATH` with `workdir` ahead of any inherited entries.
fn python_path(workdir: &Path) -> Result<std::ffi::OsString> {
    let mut paths = vec![workdir.to_path_buf()];
    if let Some(inherited) = std::env::var_os("PYTHONPATH") {
        paths.extend(std::env::split_paths(&inherited));
    }
    std::env::join_paths(paths)
        .map_err(|e| Error::TestRunner(format!("invalid PYTHONPATH for {}: {}", workdir.display(), e)))
}

#[async_trait]
impl TestRunner for PytestRunner {
    async fn run(&self, request: &TestRunRequest) -> Result<TestOutcome> {
        let selector = &request.selector;
        let mut outcome = self
            .invoke(
                &request.workdir,
                &selector.files,
                selector.marker.as_deref(),
                request.timeout,
            )
            .await?;

        if !selector.regression_files.is_empty() {
            let regression = self
                .invoke(
                    &request.workdir,
                    &selector.regression_files,
                    Some(REGRESSION_MARKER),
                    request.timeout,
                )
                .await?;
            outcome.merge(regression);
        }

        tracing::debug!(
            workdir = ?request.workdir,
            passed = outcome.passed.len(),
            failed = outcome.failed.len(),
            errored = outcome.errored.len(),
            "pytest finished"
        );
        Ok(outcome)
    }

    fn name(&self) -> &str {
        "pytest"
    }
}

/// Parses the short test summary printed by `pytest -rA`.
///
/// `PASSED` and `XPASS` count as passed, `FAILED` as failed and `ERROR` as
/// errored. Skips and expected failures are not part of the outcome.
pub fn parse_report(output: &str) -> TestOutcome {
    let mut outcome = TestOutcome::new();

    for line in output.lines() {
        let Some((word, rest)) = line.split_once(' ') else {
            continue;
        };
        let status = match word {
            "PASSED" | "XPASS" => TestStatus::Passed,
            "FAILED" => TestStatus::Failed,
            "ERROR" => TestStatus::Errored,
            _ => continue,
        };
        if let Some(id) = node_id(rest) {
            outcome.record(id, status);
        }
    }

    outcome
}

/// Extracts the node id at the start of a summary line, keeping
/// parametrize brackets that may contain spaces.
fn node_id(rest: &str) -> Option<&str> {
    let rest = rest.trim_start();
    let first_space = rest.find(char::is_whitespace).unwrap_or(rest.len());

    if let Some(open) = rest.find('[') {
        if open < first_space {
            if let Some(close) = rest[open..].find(']') {
                return Some(&rest[..open + close + 1]);
            }
        }
    }

    let id = &rest[..first_space];
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TestSelector;

    const REPORT: &str = "\
..F.E                                                                    [100%]
==================================== ERRORS ====================================
___________________ ERROR at setup of test_items_db ___________________________
fixture 'db' not found
=========================== short test summary info ============================
PASSED tests/test_items.py::test_create_item
PASSED tests/test_items.py::test_list_items
FAILED tests/test_items.py::test_read_missing_item_returns_404 - assert 500 == 404
PASSED tests/test_items.py::test_param[a b]
ERROR tests/test_items.py::test_items_db - fixture 'db' not found
XFAIL tests/test_items.py::test_later - not implemented
SKIPPED [1] tests/test_items.py:40: needs postgres
1 failed, 3 passed, 1 error, 1 xfailed, 1 skipped in 0.42s
";

    #[test]
    fn parses_summary_lines() {
        let outcome = parse_report(REPORT);

        assert_eq!(outcome.passed.len(), 3);
        assert!(outcome.passed.contains("tests/test_items.py::test_param[a b]"));
        assert!(outcome
            .failed
            .contains("tests/test_items.py::test_read_missing_item_returns_404"));
        assert!(outcome.errored.contains("tests/test_items.py::test_items_db"));
        assert_eq!(outcome.len(), 5);
    }

    #[test]
    fn teardown_error_overrides_pass() {
        let report = "PASSED t.py::a\nERROR t.py::a - teardown failed\n";
        let outcome = parse_report(report);
        assert_eq!(outcome.status("t.py::a"), Some(TestStatus::Errored));
    }

    #[test]
    fn collection_error_uses_module_id() {
        let outcome = parse_report("ERROR tests/test_broken.py - ImportError: no module\n");
        assert!(outcome.errored.contains("tests/test_broken.py"));
    }

    #[test]
    fn ignores_unrelated_output() {
        let outcome = parse_report("collected 0 items\nno tests ran in 0.01s\n");
        assert!(outcome.is_empty());
    }

    #[test]
    fn args_include_files_marker_and_flags() {
        let runner = PytestRunner::with_command(vec![
            "python".to_string(),
            "-m".to_string(),
            "pytest".to_string(),
        ]);
        let args = runner.build_args(&[PathBuf::from("/h/tests/test_a.py")], Some("aspect_bench"));
        assert_eq!(
            args,
            [
                "-m",
                "pytest",
                "/h/tests/test_a.py",
                "-m",
                "aspect_bench",
                "-rA",
                "-q",
                "-p",
                "no:cacheprovider"
            ]
        );
    }

    #[tokio::test]
    async fn missing_program_is_runner_error() {
        let runner = PytestRunner::with_command(vec!["/nonexistent/pytest".to_string()]);
        let request = TestRunRequest {
            workdir: std::env::temp_dir(),
            selector: TestSelector::default(),
            timeout: Duration::from_secs(5),
        };
        assert!(matches!(runner.run(&request).await, Err(Error::TestRunner(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn usage_error_exit_code_is_runner_error() {
        // `sh -c 'exit 4' ...` stands in for a pytest usage error.
        let runner = PytestRunner::with_command(vec![
            "sh".to_string(),
            "-c".to_string(),
            "exit 4".to_string(),
        ]);
        let request = TestRunRequest {
            workdir: std::env::temp_dir(),
            selector: TestSelector::default(),
            timeout: Duration::from_secs(5),
        };
        assert!(matches!(runner.run(&request).await, Err(Error::TestRunner(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_exit_code_still_parses() {
        let runner = PytestRunner::with_command(vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo 'PASSED t.py::a'; echo 'FAILED t.py::b - boom'; exit 1".to_string(),
        ]);
        let request = TestRunRequest {
            workdir: std::env::temp_dir(),
            selector: TestSelector::default(),
            timeout: Duration::from_secs(5),
        };
        let outcome = runner.run(&request).await.unwrap();
        assert!(outcome.passed.contains("t.py::a"));
        assert!(outcome.failed.contains("t.py::b"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_is_runner_error() {
        let runner = PytestRunner::with_command(vec![
            "sh".to_string(),
            "-c".to_string(),
            "sleep 5".to_string(),
        ]);
        let request = TestRunRequest {
            workdir: std::env::temp_dir(),
            selector: TestSelector::default(),
            timeout: Duration::from_millis(100),
        };
        assert!(matches!(runner.run(&request).await, Err(Error::TestRunner(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exports_workspace_to_python() {
        let workspace = tempfile::TempDir::new().unwrap();
        let script = format!(
            "test \"${0}\" = \"$(pwd -P)\" && echo 'PASSED env::workspace'; \
             case \"$PYTHONPATH\" in \"${0}\"*) echo 'PASSED env::python_path';; esac",
            WORKSPACE_ENV
        );
        let runner = PytestRunner::with_command(vec!["sh".to_string(), "-c".to_string(), script]);
        let request = TestRunRequest {
            workdir: workspace.path().canonicalize().unwrap(),
            selector: TestSelector::default(),
            timeout: Duration::from_secs(5),
        };

        let outcome = runner.run(&request).await.unwrap();
        assert!(outcome.passed.contains("env::workspace"));
        assert!(outcome.passed.contains("env::python_path"));
    }

    /// Harness tests live outside the workspace; their conftest must still
    /// import the patched code from the workspace.
    #[tokio::test]
    #[ignore = "requires pytest on PATH"]
    async fn harness_tests_import_code_from_workspace() {
        let harness = tempfile::TempDir::new().unwrap();
        std::fs::write(
            harness.path().join("conftest.py"),
            format!(
                "import os, sys\nsys.path.insert(0, os.environ[\"{}\"])\n",
                WORKSPACE_ENV
            ),
        )
        .unwrap();
        std::fs::write(
            harness.path().join("test_value.py"),
            "from app.value import VALUE\n\ndef test_patched():\n    assert VALUE == \"patched\"\n",
        )
        .unwrap();

        let workspace = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(workspace.path().join("app")).unwrap();
        std::fs::write(workspace.path().join("app/__init__.py"), "").unwrap();
        std::fs::write(workspace.path().join("app/value.py"), "VALUE = \"patched\"\n").unwrap();

        let request = TestRunRequest {
            workdir: workspace.path().to_path_buf(),
            selector: TestSelector {
                files: vec![harness.path().join("test_value.py")],
                ..TestSelector::default()
            },
            timeout: Duration::from_secs(60),
        };

        let outcome = PytestRunner::new().run(&request).await.unwrap();
        assert!(outcome.failed.is_empty() && outcome.errored.is_empty(), "{:?}", outcome);
        assert!(outcome.passed.iter().any(|id| id.ends_with("test_value.py::test_patched")));
    }
}
