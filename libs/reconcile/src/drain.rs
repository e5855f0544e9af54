//! Drain classification and interpretation of agent drain answers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The kind of drain requested from an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainKind {
    /// The instance goes away or loses its VM, disk or network.
    Shutdown,
    /// Configuration-only restart.
    Update,
    /// Follow-up poll of a dynamic drain.
    Status,
}

impl DrainKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrainKind::Shutdown => "shutdown",
            DrainKind::Update => "update",
            DrainKind::Status => "status",
        }
    }
}

impl std::fmt::Display for DrainKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signed drain answer returned by an agent, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DrainTime(i64);

/// What to do with a drain answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStep {
    /// Wait this long once, then stop the job.
    Wait(Duration),
    /// Wait this long, then ask the agent for the drain status again.
    PollAfter(Duration),
}

impl DrainTime {
    pub fn from_secs(secs: i64) -> Self {
        Self(secs)
    }

    pub fn secs(&self) -> i64 {
        self.0
    }

    /// True if the workload has not finished draining yet.
    pub fn is_dynamic(&self) -> bool {
        self.0 < 0
    }

    pub fn step(&self) -> DrainStep {
        let wait = Duration::from_secs(self.0.unsigned_abs());
        if self.is_dynamic() {
            DrainStep::PollAfter(wait)
        } else {
            DrainStep::Wait(wait)
        }
    }
}

impl From<i64> for DrainTime {
    fn from(secs: i64) -> Self {
        Self(secs)
    }
}

impl DrainStep {
    pub fn duration(&self) -> Duration {
        match *self {
            DrainStep::Wait(d) | DrainStep::PollAfter(d) => d,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, DrainStep::Wait(_))
    }
}
