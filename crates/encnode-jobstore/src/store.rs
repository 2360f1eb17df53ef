//! The job store seam.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use encnode_models::{AcquisitionPath, JobDescription, JobId, JobResult, JobStatus};

use crate::error::JobStoreResult;

/// Authoritative view of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub description: JobDescription,
    pub status: JobStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub assigned_worker: Option<String>,
    #[serde(default)]
    pub acquisition_path: Option<AcquisitionPath>,
    /// Completion bypasses the gateway for this job, permanently
    #[serde(default)]
    pub defensive_takeover: bool,
    #[serde(default)]
    pub result: Option<JobResult>,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl JobRecord {
    /// Fresh record for a newly published job.
    pub fn queued(description: JobDescription) -> Self {
        Self {
            updated_at: description.created_at,
            description,
            status: JobStatus::Queued,
            assigned_worker: None,
            acquisition_path: None,
            defensive_takeover: false,
            result: None,
            attempt_count: 0,
            last_error: None,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.description.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.description.created_at
    }

    pub fn is_assigned_to(&self, worker_id: &str) -> bool {
        self.assigned_worker.as_deref() == Some(worker_id)
    }

    /// Whether `age` has elapsed since creation, as of `now`.
    pub fn is_older_than(&self, age: Duration, now: DateTime<Utc>) -> bool {
        let age = chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::days(36_500));
        now - self.created_at() >= age
    }
}

/// Ownership written by a conditional claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub worker_id: String,
    pub path: AcquisitionPath,
}

impl Claim {
    pub fn new(worker_id: impl Into<String>, path: AcquisitionPath) -> Self {
        Self {
            worker_id: worker_id.into(),
            path,
        }
    }
}

/// What happened when a worker gave a failed job back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Back in `queued` for another attempt
    Requeued { attempt_count: u32 },
    /// Attempt ceiling reached, now `failed`
    Failed { attempt_count: u32 },
    /// The job is not held by this worker (or already terminal)
    NotOwner,
}

/// Authoritative job store.
///
/// Correctness of multi-worker acquisition relies entirely on the conditional
/// operations here; callers never coordinate through local state.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Publish a new job in `queued`.
    async fn enqueue(&self, description: JobDescription) -> JobStoreResult<()>;

    /// Read the current record.
    async fn get_job(&self, id: &JobId) -> JobStoreResult<Option<JobRecord>>;

    /// Jobs in `queued` created at least `age` ago, oldest first.
    ///
    /// Never returns jobs in any other status.
    async fn find_queued_older_than(
        &self,
        age: Duration,
        limit: usize,
    ) -> JobStoreResult<Vec<JobRecord>>;

    /// Atomically `queued|pending -> running` with ownership.
    ///
    /// Returns `false` when another worker got there first.
    async fn conditional_claim(&self, id: &JobId, claim: &Claim) -> JobStoreResult<bool>;

    /// Move a held job forward (e.g. `running -> uploading`).
    ///
    /// Returns `false` unless `worker_id` holds the job and the move is forward.
    async fn advance_status(
        &self,
        id: &JobId,
        worker_id: &str,
        status: JobStatus,
    ) -> JobStoreResult<bool>;

    /// Write the final result. Returns `false` if the job is already complete.
    async fn write_result(&self, id: &JobId, result: &JobResult) -> JobStoreResult<bool>;

    /// Persist the defensive-takeover flag. Returns `false` if the job is unknown.
    async fn mark_defensive_takeover(&self, id: &JobId) -> JobStoreResult<bool>;

    /// Give a failed job back, re-queueing it while attempts remain.
    async fn release(
        &self,
        id: &JobId,
        worker_id: &str,
        error: &str,
        max_attempts: u32,
    ) -> JobStoreResult<ReleaseOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use encnode_models::JobSource;

    #[test]
    fn test_age_gate_boundary() {
        let now = Utc::now();
        let desc = JobDescription::new(
            JobId::from_string("J1"),
            "ipfs://Qm",
            JobSource::Gateway {
                owner: "a".into(),
                permlink: "p".into(),
                short: false,
            },
        )
        .with_created_at(now - chrono::Duration::minutes(5));
        let record = JobRecord::queued(desc);

        assert!(record.is_older_than(Duration::from_secs(300), now));
        assert!(!record.is_older_than(Duration::from_secs(301), now));
    }
}
