//! Job state machine driver.
//!
//! Wraps one held [`Job`] and keeps the authoritative view in step with the
//! local one: direct-path jobs mirror each status into the store, gateway-path
//! jobs report progress percentages to the gateway.

use std::sync::Arc;

use tracing::{debug, info, warn};

use encnode_gateway::Gateway;
use encnode_jobstore::JobStore;
use encnode_models::{Job, JobStatus};

use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;

/// Result of the pre-processing status check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precheck {
    Proceed,
    /// Someone else finished or holds the job; stop without error
    AlreadyHandled(String),
}

pub struct JobDriver {
    job: Job,
    worker_id: String,
    store: Option<Arc<dyn JobStore>>,
    gateway: Option<Arc<dyn Gateway>>,
    logger: JobLogger,
}

impl JobDriver {
    pub fn new(
        job: Job,
        worker_id: impl Into<String>,
        store: Option<Arc<dyn JobStore>>,
        gateway: Option<Arc<dyn Gateway>>,
    ) -> Self {
        let logger = JobLogger::new(&job.id, job.acquisition_path);
        Self {
            job,
            worker_id: worker_id.into(),
            store,
            gateway,
            logger,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_mut(&mut self) -> &mut Job {
        &mut self.job
    }

    pub fn into_job(self) -> Job {
        self.job
    }

    pub fn logger(&self) -> &JobLogger {
        &self.logger
    }

    /// Re-read the authoritative status before processing starts.
    ///
    /// Gateway-path jobs proceed when the store is unreachable or does not know
    /// the job; direct-path jobs were claimed through the store and need it.
    pub async fn precheck(&mut self) -> WorkerResult<Precheck> {
        let Some(store) = &self.store else {
            return Ok(Precheck::Proceed);
        };

        let record = match store.get_job(&self.job.id).await {
            Ok(Some(record)) => record,
            Ok(None) if !self.job.bypasses_gateway() => return Ok(Precheck::Proceed),
            Ok(None) => {
                return Ok(Precheck::AlreadyHandled(
                    "job no longer in the store".to_string(),
                ))
            }
            Err(e) if !self.job.bypasses_gateway() => {
                warn!(job_id = %self.job.id, error = %e, "Status check unavailable, continuing");
                return Ok(Precheck::Proceed);
            }
            Err(e) => return Err(e.into()),
        };

        if record.defensive_takeover && !self.job.defensive_takeover {
            info!(job_id = %self.job.id, "Store marks job as taken over; bypassing gateway");
            self.job.mark_defensive_takeover();
        }

        match record.status {
            JobStatus::Complete | JobStatus::Cancelled | JobStatus::Failed => Ok(Precheck::AlreadyHandled(
                format!("job is {}", record.status),
            )),
            status
                if matches!(
                    status,
                    JobStatus::Running | JobStatus::Downloading | JobStatus::Uploading
                ) && !record.is_assigned_to(&self.worker_id) =>
            {
                Ok(Precheck::AlreadyHandled(format!(
                    "job is {} under {}",
                    status,
                    record.assigned_worker.as_deref().unwrap_or("another claim")
                )))
            }
            _ => Ok(Precheck::Proceed),
        }
    }

    /// Move forward to `next`. Returns `false` when the job is already at or past it.
    pub async fn advance(&mut self, next: JobStatus) -> WorkerResult<bool> {
        if next.is_terminal() {
            return Err(WorkerError::precondition(format!(
                "terminal status {} is set by the reporter",
                next
            )));
        }
        if !self.job.status.can_transition_to(next) {
            if self.job.is_terminal() {
                return Err(WorkerError::precondition(format!(
                    "job is already {}",
                    self.job.status
                )));
            }
            debug!(job_id = %self.job.id, current = %self.job.status, skipped = %next, "Status already reached");
            return Ok(false);
        }

        if self.job.bypasses_gateway() {
            let store = self
                .store
                .as_ref()
                .ok_or_else(|| WorkerError::config_error("direct-path job without a job store"))?;
            if !store
                .advance_status(&self.job.id, &self.worker_id, next)
                .await?
            {
                return Err(WorkerError::claim_lost(format!(
                    "store refused {} -> {} for {}",
                    self.job.status, next, self.job.id
                )));
            }
        } else if let Some(gateway) = &self.gateway {
            if let Err(e) = gateway.report_progress(&self.job.id, progress_percent(next)).await {
                self.logger
                    .log_warning(&format!("progress report failed: {}", e));
            }
        }

        self.job.transition(next)?;
        self.logger.log_progress(next.as_str());
        Ok(true)
    }
}

/// Coarse progress reported to the gateway per status.
pub fn progress_percent(status: JobStatus) -> u8 {
    match status {
        JobStatus::Pending | JobStatus::Queued | JobStatus::Assigned => 0,
        JobStatus::Downloading => 10,
        JobStatus::Running => 30,
        JobStatus::Uploading => 80,
        JobStatus::Complete | JobStatus::Failed | JobStatus::Cancelled => 100,
    }
}
