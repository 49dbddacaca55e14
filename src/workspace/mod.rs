//! Disposable per-trial workspaces.
//!
//! Every trial gets its own copy of the target repository so concurrent
//! trials never observe each other's patches. Workspaces remove themselves
//! on [`Workspace::cleanup`] and, as a fallback, on drop.

mod copy;
mod worktree;

pub use copy::{CopyWorkspace, CopyWorkspaceProvider};
pub use worktree::{WorktreeWorkspace, WorktreeWorkspaceProvider};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{RunConfig, WorkspaceKind};
use crate::error::Result;
use crate::registry::Repo;

/// An isolated, disposable working tree.
pub trait Workspace: Send + Sync {
    /// Root of the workspace (the repository root, not the backend path).
    fn path(&self) -> &Path;

    /// Removes the workspace. Idempotent.
    fn cleanup(&mut self) -> Result<()>;
}

/// Creates workspaces for a repository.
pub trait WorkspaceProvider: Send + Sync {
    /// Creates a fresh workspace from the repository's checkout.
    fn create(&self, repo: &Repo) -> Result<Box<dyn Workspace>>;

    /// Returns the name of this provider.
    fn name(&self) -> &str;
}

/// Builds the workspace provider selected by the run configuration.
pub fn from_config(run: &RunConfig, base_dir: &Path) -> Arc<dyn WorkspaceProvider> {
    match run.workspace {
        WorkspaceKind::Copy => Arc::new(
            CopyWorkspaceProvider::new(base_dir.to_path_buf()).with_skip_dirs(run.skip_dirs.clone()),
        ),
        WorkspaceKind::Worktree => Arc::new(WorktreeWorkspaceProvider::new(base_dir.to_path_buf())),
    }
}

/// Unique directory for one workspace of `repo` under `base`.
fn unique_dir(base: &Path, repo: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(base)?;
    Ok(base.join(format!("{}-{}", repo, uuid::Uuid::new_v4())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_dirs_differ() {
        let base = tempfile::TempDir::new().unwrap();
        let a = unique_dir(base.path(), "repo").unwrap();
        let b = unique_dir(base.path(), "repo").unwrap();
        assert_ne!(a, b);
        assert!(a.file_name().unwrap().to_string_lossy().starts_with("repo-"));
    }

    #[test]
    fn provider_follows_config() {
        let base = tempfile::TempDir::new().unwrap();
        let mut run = RunConfig::default();
        assert_eq!(from_config(&run, base.path()).name(), "copy");
        run.workspace = WorkspaceKind::Worktree;
        assert_eq!(from_config(&run, base.path()).name(), "worktree");
    }
}
