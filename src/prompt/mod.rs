//! Prompt compilation for the four experimental conditions.
//!
//! A prompt is a pure function of the task definition, the condition and the
//! knowledge base text; compiled prompts are persisted for audit and replay.

mod compiler;
mod condition;
mod knowledge;
mod store;

pub use compiler::{Prompt, PromptCompiler, NO_KB_INSTRUCTIONS};
pub use condition::Condition;
pub use knowledge::{extract_instructions, KnowledgeBase, INSTRUCTIONS_END, INSTRUCTIONS_START};
pub use store::PromptStore;
