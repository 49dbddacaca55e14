//! Code changes extracted from model responses.

mod apply;
mod extract;

pub use apply::apply;
pub use extract::{extract, extract_diff, extract_files};

use serde::{Deserialize, Serialize};

/// Complete contents for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReplacement {
    /// Path as written by the model, relative to the repository root.
    pub path: String,
    pub content: String,
}

/// A code change ready to apply to a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Patch {
    /// Full-file replacements.
    Files(Vec<FileReplacement>),
    /// A unified diff.
    Diff(String),
}
