//! Job state machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Persisted state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for its first claim.
    Pending,
    /// Leased to a worker.
    Processing,
    /// Command succeeded.
    Completed,
    /// Command failed; waiting for `next_retry_at`.
    Failed,
    /// Retry budget exhausted (dead letter).
    Dead,
}

impl JobState {
    /// Every state, in the order used for statistics.
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            // Claims
            (Pending, Processing) | (Failed, Processing) |
            // Lease reclaimed by another worker after expiry
            (Processing, Processing) |
            // Outcomes
            (Processing, Completed) | (Processing, Failed) | (Processing, Dead) |
            // Lease forcibly released
            (Processing, Pending) |
            // Manual resets
            (Failed, Pending) | (Dead, Pending)
        )
    }

    /// The persisted name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "dead" => Ok(Self::Dead),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}
