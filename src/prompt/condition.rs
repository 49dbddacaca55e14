//! Experimental conditions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Prompting strategy applied to a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Task prompt only.
    Baseline,
    /// Shared instructions plus the repository's own knowledge base.
    AspectKb,
    /// Instructions-only header, no knowledge base.
    NoKb,
    /// Shared instructions plus an unrelated repository's knowledge base.
    Swapped,
}

impl Condition {
    /// Every condition, in reporting order.
    pub const ALL: [Condition; 4] = [
        Condition::Baseline,
        Condition::AspectKb,
        Condition::NoKb,
        Condition::Swapped,
    ];

    /// Stable identifier used in file names and on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            Condition::Baseline => "baseline",
            Condition::AspectKb => "aspect_kb",
            Condition::NoKb => "no_kb",
            Condition::Swapped => "swapped",
        }
    }

    /// Whether the prompt embeds knowledge base text.
    pub fn uses_kb(self) -> bool {
        match self {
            Condition::Baseline | Condition::NoKb => false,
            Condition::AspectKb | Condition::Swapped => true,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Condition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "baseline" => Ok(Condition::Baseline),
            "aspect_kb" | "aspect" => Ok(Condition::AspectKb),
            "no_kb" => Ok(Condition::NoKb),
            "swapped" => Ok(Condition::Swapped),
            other => Err(Error::Config(format!("unknown condition '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_strings() {
        for condition in Condition::ALL {
            assert_eq!(condition.as_str().parse::<Condition>().unwrap(), condition);
        }
    }

    #[test]
    fn accepts_legacy_and_dashed_names() {
        assert_eq!("aspect".parse::<Condition>().unwrap(), Condition::AspectKb);
        assert_eq!("no-kb".parse::<Condition>().unwrap(), Condition::NoKb);
        assert!("oracle".parse::<Condition>().is_err());
    }

    #[test]
    fn serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Condition::AspectKb).unwrap(),
            "\"aspect_kb\""
        );
    }

    #[test]
    fn only_kb_conditions_use_kb() {
        assert!(!Condition::Baseline.uses_kb());
        assert!(!Condition::NoKb.uses_kb());
        assert!(Condition::AspectKb.uses_kb());
        assert!(Condition::Swapped.uses_kb());
    }
}
