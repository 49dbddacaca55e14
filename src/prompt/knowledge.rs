//! Knowledge base and shared instruction loading.

use std::path::Path;

use crate::error::{Error, Result};
use crate::registry::Repo;

/// Marker opening the instructions block in `AGENTS.md`.
pub const INSTRUCTIONS_START: &str = "<!-- ASPECT_CODE_START -->";

/// Marker closing the instructions block in `AGENTS.md`.
pub const INSTRUCTIONS_END: &str = "<!-- ASPECT_CODE_END -->";

/// Opaque knowledge base text produced for one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnowledgeBase {
    /// Repository the KB was generated from.
    pub repo: String,
    pub text: String,
}

impl KnowledgeBase {
    pub fn new(repo: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            text: text.into(),
        }
    }

    /// Reads the KB file configured for `repo`.
    pub fn load(repo: &Repo) -> Result<Self> {
        let text = std::fs::read_to_string(&repo.kb_file).map_err(|e| {
            Error::Config(format!(
                "failed to read knowledge base for '{}' at {}: {}",
                repo.name,
                repo.kb_file.display(),
                e
            ))
        })?;
        if text.trim().is_empty() {
            return Err(Error::Config(format!(
                "knowledge base for '{}' is empty",
                repo.name
            )));
        }
        tracing::debug!(repo = %repo.name, chars = text.len(), "loaded knowledge base");
        Ok(Self::new(repo.name.clone(), text))
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Extracts the shared instructions between the start and end markers.
pub fn extract_instructions(agents_md: &str) -> Result<String> {
    let start = agents_md.find(INSTRUCTIONS_START);
    let end = agents_md.find(INSTRUCTIONS_END);

    match (start, end) {
        (Some(start), Some(end)) if start < end => Ok(agents_md
            [start + INSTRUCTIONS_START.len()..end]
            .trim()
            .to_string()),
        _ => Err(Error::Config(
            "could not find instruction markers in AGENTS.md".to_string(),
        )),
    }
}

/// Loads and extracts the shared instructions file.
pub(crate) fn load_instructions(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "failed to read instructions file {}: {}",
            path.display(),
            e
        ))
    })?;
    extract_instructions(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_text_between_markers() {
        let doc = format!(
            "# Agents\n\nintro\n{}\n  Read architecture.md first.\n{}\ntrailer",
            INSTRUCTIONS_START, INSTRUCTIONS_END
        );
        assert_eq!(
            extract_instructions(&doc).unwrap(),
            "Read architecture.md first."
        );
    }

    #[test]
    fn missing_markers_is_config_error() {
        assert!(matches!(
            extract_instructions("no markers here"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn reversed_markers_is_config_error() {
        let doc = format!("{}\nbody\n{}", INSTRUCTIONS_END, INSTRUCTIONS_START);
        assert!(extract_instructions(&doc).is_err());
    }

    #[test]
    fn load_instructions_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("AGENTS.md");
        std::fs::write(
            &path,
            format!("{}\nGolden rules\n{}", INSTRUCTIONS_START, INSTRUCTIONS_END),
        )
        .unwrap();
        assert_eq!(load_instructions(&path).unwrap(), "Golden rules");
        assert!(load_instructions(&dir.path().join("missing.md")).is_err());
    }

    #[test]
    fn whitespace_kb_counts_as_empty() {
        assert!(KnowledgeBase::new("a", "  \n").is_empty());
        assert!(!KnowledgeBase::new("a", "hubs: app/main.py").is_empty());
    }
}
