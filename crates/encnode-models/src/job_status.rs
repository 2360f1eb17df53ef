//! Job lifecycle states.
//!
//! The lifecycle graph is linear:
//! `pending -> queued -> assigned -> downloading -> running -> uploading -> complete`,
//! with `failed` and `cancelled` reachable from every non-terminal state.
//! Status only moves forward; acquisition paths may skip intermediate steps
//! (a rescue claim goes straight from `queued` to `running`).

use serde::{Deserialize, Serialize};

/// Job processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet published for workers
    #[default]
    Pending,
    /// Waiting for a worker
    Queued,
    /// Handed to a worker, not started
    Assigned,
    /// Fetching the source
    Downloading,
    /// Encoding
    Running,
    /// Persisting the encoded output
    Uploading,
    /// Finished with a verified result
    Complete,
    /// Failed (the store may re-queue it for another attempt)
    Failed,
    /// Cancelled by the owner or an operator
    Cancelled,
}

impl JobStatus {
    /// All statuses in lifecycle order.
    pub const ALL: [JobStatus; 9] = [
        JobStatus::Pending,
        JobStatus::Queued,
        JobStatus::Assigned,
        JobStatus::Downloading,
        JobStatus::Running,
        JobStatus::Uploading,
        JobStatus::Complete,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Get string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Assigned => "assigned",
            JobStatus::Downloading => "downloading",
            JobStatus::Running => "running",
            JobStatus::Uploading => "uploading",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Parse from the wire representation.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|status| status.as_str() == s)
    }

    /// Check if this is a terminal state (no more claims permitted).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Check if a worker may still claim a job in this state.
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Queued)
    }

    /// Position along the happy path. Terminal failure states have no rank.
    fn rank(&self) -> Option<u8> {
        match self {
            JobStatus::Pending => Some(0),
            JobStatus::Queued => Some(1),
            JobStatus::Assigned => Some(2),
            JobStatus::Downloading => Some(3),
            JobStatus::Running => Some(4),
            JobStatus::Uploading => Some(5),
            JobStatus::Complete => Some(6),
            JobStatus::Failed | JobStatus::Cancelled => None,
        }
    }

    /// Whether `next` is a legal forward move from this status.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (Some(current), Some(target)) => target > current,
            (None, Some(_)) => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
