//! Trials: one task run under one condition.

mod executor;
mod record;

pub(crate) use executor::wait_cancelled;
pub use executor::{TrialExecutor, TrialSpec};
pub use record::{Failure, FailureReason, TrialKey, TrialResult, TrialStatus};
