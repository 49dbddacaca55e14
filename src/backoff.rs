//! Exponential backoff and the per-trial retry state machine.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Exponential backoff with configurable min/max.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    /// Creates a new backoff starting at `initial`, capping at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Returns the current backoff duration.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Advances to the next backoff interval (doubles, capped at max).
    pub fn next(&mut self) {
        self.current = (self.current * 2).min(self.max);
    }

    /// Resets backoff to initial value.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Upper bound for any single delay.
    pub fn max(&self) -> Duration {
        self.max
    }
}

/// Retry limits applied to each model invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay.
    #[serde(rename = "initial_backoff_ms", default = "default_initial_backoff", with = "millis")]
    pub initial_backoff: Duration,
    /// Largest backoff delay.
    #[serde(rename = "max_backoff_ms", default = "default_max_backoff", with = "millis")]
    pub max_backoff: Duration,
    /// Wall-clock budget for all attempts of one trial.
    #[serde(rename = "deadline_ms", default = "default_deadline", with = "millis")]
    pub deadline: Duration,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_secs(2)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(60)
}

fn default_deadline() -> Duration {
    Duration::from_secs(30 * 60)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            deadline: default_deadline(),
        }
    }
}

impl RetryPolicy {
    /// Starts a fresh retry state for one trial.
    pub fn start(&self) -> RetryState {
        RetryState {
            attempt: 0,
            max_retries: self.max_retries,
            backoff: ExponentialBackoff::new(self.initial_backoff, self.max_backoff),
            deadline: Instant::now().checked_add(self.deadline),
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then try again.
    Retry(Duration),
    /// Stop; the error is permanent.
    Reject,
    /// Stop; retries or the deadline are exhausted.
    Exhausted,
}

/// Attempt counter with a monotonic deadline.
#[derive(Debug, Clone)]
pub struct RetryState {
    attempt: u32,
    max_retries: u32,
    backoff: ExponentialBackoff,
    /// `None` when the configured deadline is beyond what `Instant` can represent.
    deadline: Option<Instant>,
}

impl RetryState {
    /// Number of retries performed so far.
    pub fn retries(&self) -> u32 {
        self.attempt
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Duration {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    /// Records a failed attempt and decides whether to try again.
    pub fn on_error(&mut self, err: &ProviderError) -> RetryDecision {
        if !err.is_retryable() {
            return RetryDecision::Reject;
        }
        if self.attempt >= self.max_retries {
            return RetryDecision::Exhausted;
        }

        let delay = err
            .retry_after()
            .map(|hint| hint.min(self.backoff.max()))
            .unwrap_or_else(|| self.backoff.current());

        if delay >= self.remaining() {
            return RetryDecision::Exhausted;
        }

        self.attempt += 1;
        self.backoff.next();
        RetryDecision::Retry(delay)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
