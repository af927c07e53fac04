use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{ErrorInfo, SimoutError};

/// Identifies one simulation run within the experiment grid.
///
/// Scenario and replication identifiers are assigned by the orchestrator
/// starting at 1. The pair is immutable and compares structurally, so it can
/// be used directly as a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawCoordinate")]
pub struct RunCoordinate {
    scenario: u32,
    replication: u32,
}

#[derive(Deserialize)]
struct RawCoordinate {
    scenario: u32,
    replication: u32,
}

impl TryFrom<RawCoordinate> for RunCoordinate {
    type Error = SimoutError;

    fn try_from(raw: RawCoordinate) -> Result<Self, Self::Error> {
        Self::new(raw.scenario, raw.replication)
    }
}

impl RunCoordinate {
    /// Creates a coordinate, rejecting zero identifiers.
    pub fn new(scenario: u32, replication: u32) -> Result<Self, SimoutError> {
        if scenario == 0 || replication == 0 {
            return Err(SimoutError::Lifecycle(
                ErrorInfo::new(
                    "lifecycle.invalid_coordinate",
                    "run identifiers start at 1",
                )
                .with_context("scenario", scenario.to_string())
                .with_context("replication", replication.to_string()),
            ));
        }
        Ok(Self {
            scenario,
            replication,
        })
    }

    /// Returns the scenario identifier.
    pub fn scenario(&self) -> u32 {
        self.scenario
    }

    /// Returns the replication identifier.
    pub fn replication(&self) -> u32 {
        self.replication
    }
}

impl fmt::Display for RunCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.scenario, self.replication)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_identifiers_are_rejected() {
        let err = RunCoordinate::new(0, 1).unwrap_err();
        assert_eq!(err.code(), "lifecycle.invalid_coordinate");
        assert!(RunCoordinate::new(3, 0).is_err());
    }

    #[test]
    fn ordering_is_scenario_major() {
        let a = RunCoordinate::new(1, 9).unwrap();
        let b = RunCoordinate::new(2, 1).unwrap();
        assert!(a < b);
        assert_eq!(a.to_string(), "(1,9)");
    }
}
