//! In-memory job store.
//!
//! Single-process stand-in for the authoritative store. Every conditional
//! operation runs under one lock, which gives the same first-writer-wins
//! semantics as the Redis scripts.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use encnode_models::{JobDescription, JobId, JobResult, JobStatus};

use crate::error::{JobStoreError, JobStoreResult};
use crate::store::{Claim, JobRecord, JobStore, ReleaseOutcome};

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<JobId, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record as-is (seeding fixtures in any status).
    pub async fn insert(&self, record: JobRecord) {
        self.jobs.lock().await.insert(record.id().clone(), record);
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, description: JobDescription) -> JobStoreResult<()> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&description.id) {
            return Err(JobStoreError::AlreadyExists(description.id.to_string()));
        }
        jobs.insert(description.id.clone(), JobRecord::queued(description));
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> JobStoreResult<Option<JobRecord>> {
        Ok(self.jobs.lock().await.get(id).cloned())
    }

    async fn find_queued_older_than(
        &self,
        age: Duration,
        limit: usize,
    ) -> JobStoreResult<Vec<JobRecord>> {
        let now = Utc::now();
        let jobs = self.jobs.lock().await;
        let mut candidates: Vec<JobRecord> = jobs
            .values()
            .filter(|r| r.status == JobStatus::Queued && r.is_older_than(age, now))
            .cloned()
            .collect();
        candidates.sort_by_key(|r| r.created_at());
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn conditional_claim(&self, id: &JobId, claim: &Claim) -> JobStoreResult<bool> {
        let mut jobs = self.jobs.lock().await;
        let Some(record) = jobs.get_mut(id) else {
            return Ok(false);
        };
        if !record.status.is_claimable() {
            return Ok(false);
        }
        record.status = JobStatus::Running;
        record.assigned_worker = Some(claim.worker_id.clone());
        record.acquisition_path = Some(claim.path);
        record.defensive_takeover |= claim.path.bypasses_gateway();
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn advance_status(
        &self,
        id: &JobId,
        worker_id: &str,
        status: JobStatus,
    ) -> JobStoreResult<bool> {
        let mut jobs = self.jobs.lock().await;
        let Some(record) = jobs.get_mut(id) else {
            return Ok(false);
        };
        if !record.is_assigned_to(worker_id) || !record.status.can_transition_to(status) {
            return Ok(false);
        }
        record.status = status;
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn write_result(&self, id: &JobId, result: &JobResult) -> JobStoreResult<bool> {
        let mut jobs = self.jobs.lock().await;
        let Some(record) = jobs.get_mut(id) else {
            return Ok(false);
        };
        if matches!(record.status, JobStatus::Complete | JobStatus::Cancelled) {
            return Ok(false);
        }
        record.status = JobStatus::Complete;
        record.result = Some(result.clone());
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_defensive_takeover(&self, id: &JobId) -> JobStoreResult<bool> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(id) {
            Some(record) => {
                record.defensive_takeover = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release(
        &self,
        id: &JobId,
        worker_id: &str,
        error: &str,
        max_attempts: u32,
    ) -> JobStoreResult<ReleaseOutcome> {
        let mut jobs = self.jobs.lock().await;
        let Some(record) = jobs.get_mut(id) else {
            return Ok(ReleaseOutcome::NotOwner);
        };
        if !record.is_assigned_to(worker_id) || record.status.is_terminal() {
            return Ok(ReleaseOutcome::NotOwner);
        }

        record.attempt_count = record.attempt_count.saturating_add(1);
        record.last_error = Some(error.to_string());
        record.updated_at = Utc::now();

        if record.attempt_count >= max_attempts {
            record.status = JobStatus::Failed;
            return Ok(ReleaseOutcome::Failed {
                attempt_count: record.attempt_count,
            });
        }

        record.status = JobStatus::Queued;
        record.assigned_worker = None;
        record.acquisition_path = None;
        Ok(ReleaseOutcome::Requeued {
            attempt_count: record.attempt_count,
        })
    }
}
