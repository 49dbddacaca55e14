//! Git worktree-based workspaces.
//!
//! Only committed content is visible in a worktree, so this strategy suits
//! clean checkouts. Worktrees are detached; no branches are created.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};
use crate::registry::Repo;

use super::{unique_dir, Workspace, WorkspaceProvider};

/// A workspace backed by a detached git worktree.
pub struct WorktreeWorkspace {
    /// Path to the worktree directory.
    path: PathBuf,
    /// Path to the parent git repository.
    repo_path: PathBuf,
    /// Whether the workspace has been cleaned up.
    cleaned_up: bool,
}

impl Workspace for WorktreeWorkspace {
    fn path(&self) -> &Path {
        &self.path
    }

    fn cleanup(&mut self) -> Result<()> {
        if self.cleaned_up {
            return Ok(());
        }

        // Must run from the parent repo
        let output = Command::new("git")
            .current_dir(&self.repo_path)
            .args(["worktree", "remove", "--force"])
            .arg(&self.path)
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::WorkspaceCleanup {
                path: self.path.clone(),
                reason: stderr.to_string(),
            });
        }

        tracing::debug!(path = ?self.path, "removed worktree");
        self.cleaned_up = true;
        Ok(())
    }
}

impl Drop for WorktreeWorkspace {
    fn drop(&mut self) {
        if !self.cleaned_up {
            if let Err(e) = self.cleanup() {
                tracing::error!(error = %e, path = ?self.path, "failed to cleanup worktree on drop");
            }
        }
    }
}

/// Provider that creates detached worktrees at the repository's `HEAD`.
#[derive(Debug, Clone)]
pub struct WorktreeWorkspaceProvider {
    /// Base directory for worktrees.
    base_dir: PathBuf,
}

impl WorktreeWorkspaceProvider {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }
}

impl WorkspaceProvider for WorktreeWorkspaceProvider {
    fn create(&self, repo: &Repo) -> Result<Box<dyn Workspace>> {
        let path = unique_dir(&self.base_dir, &repo.name)?;

        let output = Command::new("git")
            .current_dir(&repo.root)
            .args(["worktree", "add", "--detach"])
            .arg(&path)
            .arg("HEAD")
            .output()
            .map_err(|e| Error::Workspace(format!("failed to run git in {}: {}", repo.root.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Workspace(format!(
                "git worktree add failed: {}",
                stderr.trim()
            )));
        }

        tracing::debug!(repo = %repo.name, path = ?path, "created worktree");

        Ok(Box::new(WorktreeWorkspace {
            path,
            repo_path: repo.root.clone(),
            cleaned_up: false,
        }))
    }

    fn name(&self) -> &str {
        "worktree"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RepoConfig, RepoRegistry};
    use tempfile::TempDir;

    /// Helper to create a temp git repo for testing.
    fn create_temp_git_repo() -> TempDir {
        let temp_dir = TempDir::new().expect("failed to create temp dir");

        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test User"],
        ] {
            Command::new("git")
                .args(&args)
                .current_dir(temp_dir.path())
                .output()
                .expect("failed to configure git repo");
        }

        std::fs::write(temp_dir.path().join("main.py"), "print('hi')\n")
            .expect("failed to write main.py");

        Command::new("git")
            .args(["add", "."])
            .current_dir(temp_dir.path())
            .output()
            .expect("failed to add files");

        Command::new("git")
            .args(["commit", "-m", "Initial commit"])
            .current_dir(temp_dir.path())
            .output()
            .expect("failed to create initial commit");

        temp_dir
    }

    fn repo_at(root: &Path) -> Repo {
        let registry = RepoRegistry::new(&[RepoConfig::new("demo", root)], root, root, root).unwrap();
        registry.get("demo").unwrap().clone()
    }

    #[test]
    fn creates_and_cleans_up() {
        let git_repo = create_temp_git_repo();
        let base = TempDir::new().unwrap();
        let provider = WorktreeWorkspaceProvider::new(base.path().to_path_buf());

        let mut workspace = provider.create(&repo_at(git_repo.path())).unwrap();
        assert!(workspace.path().join("main.py").exists());

        let path = workspace.path().to_path_buf();
        workspace.cleanup().unwrap();
        assert!(!path.exists());
        workspace.cleanup().expect("second cleanup should be idempotent");
    }

    #[test]
    fn does_not_create_branches() {
        let git_repo = create_temp_git_repo();
        let base = TempDir::new().unwrap();
        let provider = WorktreeWorkspaceProvider::new(base.path().to_path_buf());
        let _workspace = provider.create(&repo_at(git_repo.path())).unwrap();

        let output = Command::new("git")
            .args(["branch", "--list"])
            .current_dir(git_repo.path())
            .output()
            .unwrap();
        let branches = String::from_utf8_lossy(&output.stdout);
        assert_eq!(branches.lines().count(), 1);
    }

    #[test]
    fn non_git_directory_fails() {
        let plain = TempDir::new().unwrap();
        let base = TempDir::new().unwrap();
        let provider = WorktreeWorkspaceProvider::new(base.path().to_path_buf());
        assert!(matches!(
            provider.create(&repo_at(plain.path())),
            Err(Error::Workspace(_))
        ));
    }
}
