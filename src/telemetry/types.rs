//! Telemetry Types

use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bytes drained from the aggregate counter at one sampler tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub bytes: u64,
    pub taken_at: DateTime<Utc>,
}

impl TelemetrySnapshot {
    pub fn new(bytes: u64) -> Self {
        Self {
            bytes,
            taken_at: Utc::now(),
        }
    }

    pub fn at(bytes: u64, taken_at: DateTime<Utc>) -> Self {
        Self { bytes, taken_at }
    }
}

/// Which snapshots a `/data` subscriber receives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmitPolicy {
    /// Skip ticks where nothing was relayed
    #[default]
    NonZero,
    /// Emit every tick, including `data: 0`
    Always,
}

impl EmitPolicy {
    pub fn should_emit(&self, bytes: u64) -> bool {
        match self {
            EmitPolicy::NonZero => bytes != 0,
            EmitPolicy::Always => true,
        }
    }
}

impl FromStr for EmitPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "non_zero" | "non-zero" | "nonzero" => Ok(EmitPolicy::NonZero),
            "always" => Ok(EmitPolicy::Always),
            other => Err(anyhow!(
                "Unknown emit policy '{}', expected 'non_zero' or 'always'",
                other
            )),
        }
    }
}

impl fmt::Display for EmitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmitPolicy::NonZero => write!(f, "non_zero"),
            EmitPolicy::Always => write!(f, "always"),
        }
    }
}
