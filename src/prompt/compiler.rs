//! Condition-specific prompt compilation.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::registry::{PatchFormat, TaskDefinition};

use super::condition::Condition;
use super::knowledge::{KnowledgeBase, INSTRUCTIONS_END, INSTRUCTIONS_START};

/// Instructions-only header for the no-KB control. Replaces the shared
/// instructions so the control isolates instruction-following from context.
pub const NO_KB_INSTRUCTIONS: &str = "## AI Coding Agent Instructions

### Knowledge Base (Optional)

If `.aspect/*.md` files are included in this prompt, treat them as the project knowledge base:

| File | Purpose |
|------|---------|
| `architecture.md` | Read first. High-risk hubs, directory layout, entry points |
| `map.md` | Data models with signatures, symbol index, naming conventions |
| `context.md` | Co-edited module clusters, external integrations, data flows |

If no such files are included, rely on general coding knowledge.

### Rules

1. Read before you write.
2. Prefer minimal, local changes over refactors.
3. Never truncate code or leave placeholders such as `# existing code...`.
4. Do not modify tests, migrations or third-party code unless asked.
5. Never remove logic that is still referenced.
6. Follow the project's existing naming and import conventions.";

/// A compiled prompt for one (repo, task, condition).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub repo: String,
    pub task_id: String,
    pub condition: Condition,
    /// Repository the embedded KB came from, if any.
    pub kb_source: Option<String>,
    pub compiled_text: String,
    /// Set when the prompt is persisted.
    #[serde(default)]
    pub generated_at: Option<DateTime<Utc>>,
}

/// Compiles task definitions into condition-specific prompt text.
#[derive(Debug, Clone)]
pub struct PromptCompiler {
    /// Shared instructions embedded by the KB conditions.
    instructions: String,
}

impl PromptCompiler {
    /// Creates a compiler around the shared instructions text.
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
        }
    }

    /// Loads the shared instructions from an `AGENTS.md` style file.
    pub fn from_instructions_file(path: &std::path::Path) -> Result<Self> {
        super::knowledge::load_instructions(path).map(Self::new)
    }

    /// Compiles the prompt for `task` in `repo` under `condition`.
    ///
    /// Deterministic: identical arguments always produce identical text.
    pub fn compile(
        &self,
        repo: &str,
        task: &TaskDefinition,
        condition: Condition,
        kb: Option<&KnowledgeBase>,
    ) -> Result<Prompt> {
        let kb = kb.filter(|kb| !kb.is_empty());
        let body = render_task(task);

        let (compiled_text, kb_source) = match condition {
            Condition::Baseline => {
                reject_kb(condition, kb)?;
                (body, None)
            }
            Condition::NoKb => {
                reject_kb(condition, kb)?;
                (self.no_kb_header() + &body, None)
            }
            Condition::AspectKb => {
                let kb = require_kb(condition, task, kb)?;
                if kb.repo != repo {
                    return Err(Error::Config(format!(
                        "aspect_kb prompt for '{}' must use its own knowledge base, got '{}'",
                        repo, kb.repo
                    )));
                }
                (self.kb_header(kb) + &body, Some(kb.repo.clone()))
            }
            Condition::Swapped => {
                let kb = require_kb(condition, task, kb)?;
                if kb.repo == repo {
                    return Err(Error::InvalidSwap(format!(
                        "swapped prompt for '{}' task '{}' was given its own knowledge base",
                        repo, task.id
                    )));
                }
                (self.kb_header(kb) + &body, Some(kb.repo.clone()))
            }
        };

        Ok(Prompt {
            repo: repo.to_string(),
            task_id: task.id.clone(),
            condition,
            kb_source,
            compiled_text,
            generated_at: None,
        })
    }

    fn kb_header(&self, kb: &KnowledgeBase) -> String {
        format!(
            "# AI Coding Assistant Instructions\n\n{}\n{}\n{}\n\n# Aspect Code Knowledge Base\n\n{}\n\n",
            INSTRUCTIONS_START,
            self.instructions.trim(),
            INSTRUCTIONS_END,
            kb.text.trim_end()
        )
    }

    fn no_kb_header(&self) -> String {
        format!(
            "# AI Coding Assistant Instructions\n\n{}\n{}\n{}\n\n",
            INSTRUCTIONS_START, NO_KB_INSTRUCTIONS, INSTRUCTIONS_END
        )
    }
}

fn reject_kb(condition: Condition, kb: Option<&KnowledgeBase>) -> Result<()> {
    match kb {
        Some(kb) => Err(Error::Config(format!(
            "{} prompts cannot embed a knowledge base (got KB from '{}')",
            condition, kb.repo
        ))),
        None => Ok(()),
    }
}

fn require_kb<'a>(
    condition: Condition,
    task: &TaskDefinition,
    kb: Option<&'a KnowledgeBase>,
) -> Result<&'a KnowledgeBase> {
    kb.ok_or_else(|| {
        Error::Config(format!(
            "{} prompt for task '{}' requires a knowledge base",
            condition, task.id
        ))
    })
}

/// Renders the condition-independent task body.
fn render_task(task: &TaskDefinition) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# Task: {}\n", task.name.trim());
    let _ = writeln!(out, "{}\n", task.description.trim());

    if let Some(context) = task.baseline_context.as_deref().map(str::trim) {
        if !context.is_empty() {
            let _ = writeln!(out, "## Project Context\n\n{}\n", context);
        }
    }

    out.push_str("## Files to Modify\n\n");
    for file in &task.target_files {
        let _ = writeln!(out, "- `{}`", file);
    }
    out.push('\n');

    if !task.expected_changes.is_empty() {
        out.push_str("## Expected Changes\n\n");
        for change in &task.expected_changes {
            let _ = writeln!(out, "- {}", change.trim());
        }
        out.push('\n');
    }

    out.push_str("## Output Format\n\n");
    match task.patch_format {
        PatchFormat::FullFile => out.push_str(
            "Return the complete contents of every file you change, each in its own fenced \
             code block. The first line inside each block must be a comment of the form \
             `# filepath: <path relative to the repository root>`. Do not abbreviate \
             unchanged code.\n",
        ),
        PatchFormat::Diff => out.push_str(
            "Return a single unified diff in a ```diff fenced block. Use paths relative to \
             the repository root with `a/` and `b/` prefixes and include enough context \
             lines for the patch to apply cleanly.\n",
        ),
    }

    out
}
