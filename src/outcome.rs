//! Tri-state outcome shared by batches and scheduled posts.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How a parent entity ended once all of its items settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Every item succeeded.
    Succeeded,
    /// Some items succeeded and some failed.
    Partial,
    /// No item succeeded.
    Failed,
}

impl Outcome {
    /// Derives the outcome from settled item counts.
    pub fn from_counts(succeeded: u32, failed: u32) -> Self {
        match (succeeded, failed) {
            (_, 0) => Outcome::Succeeded,
            (0, _) => Outcome::Failed,
            _ => Outcome::Partial,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Partial => "partial",
            Outcome::Failed => "failed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(Outcome::Succeeded),
            "partial" => Ok(Outcome::Partial),
            "failed" => Ok(Outcome::Failed),
            other => Err(format!("unknown outcome '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_from_counts() {
        assert_eq!(Outcome::from_counts(3, 0), Outcome::Succeeded);
        assert_eq!(Outcome::from_counts(2, 1), Outcome::Partial);
        assert_eq!(Outcome::from_counts(0, 3), Outcome::Failed);
    }

    #[test]
    fn test_outcome_parse_roundtrip() {
        for outcome in [Outcome::Succeeded, Outcome::Partial, Outcome::Failed] {
            assert_eq!(outcome.as_str().parse::<Outcome>(), Ok(outcome));
        }
        assert!("mixed".parse::<Outcome>().is_err());
    }
}
