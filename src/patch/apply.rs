//! All-or-nothing patch application.

use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::{Error, Result};

use super::{FileReplacement, Patch};

/// Applies `patch` to the workspace rooted at `root`.
///
/// Nothing is written unless the whole patch can be applied. Returns the
/// modified paths relative to `root`.
pub fn apply(patch: &Patch, root: &Path, backend_path: &Path) -> Result<Vec<String>> {
    match patch {
        Patch::Files(files) => apply_files(files, root, backend_path),
        Patch::Diff(diff) => apply_diff(diff, root, backend_path),
    }
}

/// Rejects absolute paths and paths escaping the workspace.
fn checked_relative(path: &str) -> Result<PathBuf> {
    let relative = PathBuf::from(path);
    let safe = !path.is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if safe {
        Ok(relative)
    } else {
        Err(Error::Patch(format!("refusing to write outside the workspace: {}", path)))
    }
}

/// Resolves where a replacement lands, trying `backend_path` when the
/// parent directory does not exist at the root.
fn resolve_target(path: &str, root: &Path, backend_path: &Path) -> Result<PathBuf> {
    let relative = checked_relative(path)?;

    let direct = root.join(&relative);
    if direct.parent().is_some_and(Path::is_dir) {
        return Ok(relative);
    }

    if !backend_path.as_os_str().is_empty() {
        let nested = backend_path.join(&relative);
        if root.join(&nested).parent().is_some_and(Path::is_dir) {
            return Ok(nested);
        }
    }

    Err(Error::Patch(format!(
        "target directory for {} does not exist in the workspace",
        path
    )))
}

fn apply_files(files: &[FileReplacement], root: &Path, backend_path: &Path) -> Result<Vec<String>> {
    let targets = files
        .iter()
        .map(|f| resolve_target(&f.path, root, backend_path))
        .collect::<Result<Vec<_>>>()?;

    let mut originals: Vec<(PathBuf, Option<Vec<u8>>)> = Vec::with_capacity(targets.len());
    for (file, relative) in files.iter().zip(&targets) {
        let absolute = root.join(relative);
        let original = std::fs::read(&absolute).ok();
        originals.push((absolute.clone(), original));

        if let Err(e) = std::fs::write(&absolute, &file.content) {
            restore(&originals);
            return Err(Error::Patch(format!("failed to write {}: {}", file.path, e)));
        }
    }

    Ok(targets
        .iter()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .collect())
}

fn restore(originals: &[(PathBuf, Option<Vec<u8>>)]) {
    for (path, original) in originals {
        let result = match original {
            Some(bytes) => std::fs::write(path, bytes),
            None => std::fs::remove_file(path),
        };
        if let Err(e) = result {
            tracing::warn!(path = ?path, error = %e, "failed to restore file after partial patch");
        }
    }
}

fn apply_diff(diff: &str, root: &Path, backend_path: &Path) -> Result<Vec<String>> {
    let paths = super::extract::diff_paths(diff);
    for path in &paths {
        checked_relative(path)?;
    }

    let direct = git_apply(diff, root, None, true);
    let directory = match direct {
        Ok(()) => None,
        Err(first) => {
            if backend_path.as_os_str().is_empty() {
                return Err(first);
            }
            let dir = backend_path.to_string_lossy().replace('\\', "/");
            git_apply(diff, root, Some(&dir), true).map_err(|_| first)?;
            Some(dir)
        }
    };

    git_apply(diff, root, directory.as_deref(), false)?;

    Ok(paths
        .into_iter()
        .map(|p| match &directory {
            Some(dir) => format!("{}/{}", dir, p),
            None => p,
        })
        .collect())
}

/// Runs `git apply` (or `--check`) with the diff on stdin.
///
/// Repository discovery is capped at the workspace so a workspace nested in
/// another checkout never applies to the outer repository.
fn git_apply(diff: &str, root: &Path, directory: Option<&str>, check: bool) -> Result<()> {
    let mut command = Command::new("git");
    command.current_dir(root).arg("apply").arg("--recount");
    if check {
        command.arg("--check");
    }
    if let Some(dir) = directory {
        command.arg(format!("--directory={}", dir));
    }
    if let Some(parent) = root.parent() {
        command.env("GIT_CEILING_DIRECTORIES", parent);
    }

    let mut child = command
        .arg("-")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Patch(format!("failed to run git apply: {}", e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(diff.as_bytes())
            .map_err(|e| Error::Patch(format!("failed to pass diff to git apply: {}", e)))?;
    }

    let output = child
        .wait_with_output()
        .map_err(|e| Error::Patch(format!("failed to wait for git apply: {}", e)))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(Error::Patch(format!(
            "git apply{} failed: {}",
            if check { " --check" } else { "" },
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}
