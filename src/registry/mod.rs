//! Registries for target repositories and their benchmark tasks.
//!
//! Both registries are plain data built once at run start and passed by
//! reference to the components that need them.

mod repo;
mod task;

pub use repo::{Repo, RepoConfig, RepoRegistry};
pub use task::{Difficulty, PatchFormat, TaskDefinition, TaskFile, TaskRegistry, TestSelector};
