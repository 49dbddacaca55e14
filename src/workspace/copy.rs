//! Full-copy workspaces.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::registry::Repo;

use super::{unique_dir, Workspace, WorkspaceProvider};

/// A workspace holding a plain copy of the repository tree.
pub struct CopyWorkspace {
    path: PathBuf,
    cleaned_up: bool,
}

impl Workspace for CopyWorkspace {
    fn path(&self) -> &Path {
        &self.path
    }

    fn cleanup(&mut self) -> Result<()> {
        if self.cleaned_up {
            return Ok(());
        }

        if self.path.exists() {
            std::fs::remove_dir_all(&self.path).map_err(|e| Error::WorkspaceCleanup {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        }

        tracing::debug!(path = ?self.path, "removed workspace copy");
        self.cleaned_up = true;
        Ok(())
    }
}

impl Drop for CopyWorkspace {
    fn drop(&mut self) {
        if !self.cleaned_up {
            if let Err(e) = self.cleanup() {
                tracing::error!(error = %e, path = ?self.path, "failed to cleanup workspace on drop");
            }
        }
    }
}

/// Provider that copies the repository checkout, skipping `.git` and
/// configured directory names.
#[derive(Debug, Clone)]
pub struct CopyWorkspaceProvider {
    base_dir: PathBuf,
    skip_dirs: Vec<String>,
}

impl CopyWorkspaceProvider {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            skip_dirs: Vec::new(),
        }
    }

    /// Directory names (at any depth) that are not copied.
    pub fn with_skip_dirs(mut self, skip_dirs: Vec<String>) -> Self {
        self.skip_dirs = skip_dirs;
        self
    }

    fn skipped(&self, name: &str) -> bool {
        name == ".git" || self.skip_dirs.iter().any(|s| s == name)
    }

    fn copy_tree(&self, source: &Path, dest: &Path) -> Result<u64> {
        let mut files = 0;
        let walker = WalkDir::new(source).into_iter().filter_entry(|entry| {
            entry.depth() == 0
                || !(entry.file_type().is_dir() && self.skipped(&entry.file_name().to_string_lossy()))
        });

        for entry in walker {
            let entry = entry.map_err(|e| Error::Workspace(format!("walk failed: {}", e)))?;
            let relative = entry
                .path()
                .strip_prefix(source)
                .map_err(|e| Error::Workspace(e.to_string()))?;
            let target = dest.join(relative);

            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target)?;
            } else if entry.file_type().is_symlink() {
                copy_symlink(entry.path(), &target)?;
            } else {
                std::fs::copy(entry.path(), &target)?;
                files += 1;
            }
        }

        Ok(files)
    }
}

#[cfg(unix)]
fn copy_symlink(source: &Path, target: &Path) -> Result<()> {
    let link = std::fs::read_link(source)?;
    std::os::unix::fs::symlink(link, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, target: &Path) -> Result<()> {
    if source.is_file() {
        std::fs::copy(source, target)?;
    }
    Ok(())
}

impl WorkspaceProvider for CopyWorkspaceProvider {
    fn create(&self, repo: &Repo) -> Result<Box<dyn Workspace>> {
        if !repo.root.is_dir() {
            return Err(Error::Workspace(format!(
                "repository checkout {} does not exist",
                repo.root.display()
            )));
        }

        let path = unique_dir(&self.base_dir, &repo.name)?;
        // Constructed first so a failed copy is still removed on drop.
        let workspace = CopyWorkspace {
            path,
            cleaned_up: false,
        };

        let files = self
            .copy_tree(&repo.root, &workspace.path)
            .map_err(|e| Error::Workspace(format!("copy of {} failed: {}", repo.name, e)))?;

        tracing::debug!(repo = %repo.name, path = ?workspace.path, files, "created workspace copy");
        Ok(Box::new(workspace))
    }

    fn name(&self) -> &str {
        "copy"
    }
}
