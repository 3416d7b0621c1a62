//! Analytic domains served by the orchestrator.
//!
//! Each domain owns one [`JobLedger`](crate::ledger::JobLedger) and maps to
//! one worker program in the supervisor's registry. The lowercase name is
//! used in URLs, program identifiers, and push event names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Program identifier for forecasting runs.
pub const PROGRAM_FORECAST: &str = "forecast";

/// Program identifier for load/generation profile generation.
pub const PROGRAM_PROFILE: &str = "profile";

/// Program identifier for power-system optimization.
pub const PROGRAM_OPTIMIZATION: &str = "optimization";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Forecast,
    Profile,
    Optimization,
}

impl Domain {
    /// Every domain, in a stable order.
    pub const ALL: [Domain; 3] = [Domain::Forecast, Domain::Profile, Domain::Optimization];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Forecast => PROGRAM_FORECAST,
            Domain::Profile => PROGRAM_PROFILE,
            Domain::Optimization => PROGRAM_OPTIMIZATION,
        }
    }

    /// Identifier of the worker program that serves this domain.
    pub fn program(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            PROGRAM_FORECAST => Ok(Domain::Forecast),
            PROGRAM_PROFILE => Ok(Domain::Profile),
            PROGRAM_OPTIMIZATION => Ok(Domain::Optimization),
            other => Err(CoreError::Validation(format!("Unknown domain: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
