//! Completion reporter.
//!
//! Gateway-path jobs report through the gateway. Jobs marked as defensive
//! takeover (locally or in the store) write straight to the store and never
//! touch the gateway again. Force-complete is the operator path and refuses
//! to overwrite a completed job.

use std::sync::Arc;

use tracing::{debug, info, warn};

use encnode_gateway::Gateway;
use encnode_jobstore::{JobStore, ReleaseOutcome};
use encnode_models::{Job, JobId, JobResult, JobStatus};

use crate::error::{WorkerError, WorkerResult};
use crate::metrics::record_failed;
use crate::retry::{retry_async, RetryConfig};

/// Where a completion went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionRoute {
    /// Reported to the gateway; `acknowledged` is false when a 5xx was tolerated
    Gateway { acknowledged: bool },
    /// Written to the store
    Direct,
    /// The store already held a completed result
    AlreadyComplete,
}

impl CompletionRoute {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionRoute::Gateway { .. } => "gateway",
            CompletionRoute::Direct => "direct",
            CompletionRoute::AlreadyComplete => "already_complete",
        }
    }
}

/// Where a failure went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureRoute {
    Gateway { acknowledged: bool },
    Requeued { attempt_count: u32 },
    Failed { attempt_count: u32 },
    /// The store no longer shows this worker as holder
    NotOwner,
}

pub struct CompletionReporter {
    worker_id: String,
    gateway: Option<Arc<dyn Gateway>>,
    store: Option<Arc<dyn JobStore>>,
    max_attempts: u32,
    retry: RetryConfig,
}

impl CompletionReporter {
    pub fn new(
        worker_id: impl Into<String>,
        gateway: Option<Arc<dyn Gateway>>,
        store: Option<Arc<dyn JobStore>>,
        max_attempts: u32,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            gateway,
            store,
            max_attempts,
            retry: RetryConfig::new("store_write"),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn store(&self) -> WorkerResult<&Arc<dyn JobStore>> {
        self.store
            .as_ref()
            .ok_or_else(|| WorkerError::config_error("no job store configured"))
    }

    /// Adopt a takeover flag another path persisted after this job was acquired.
    ///
    /// Returns whether the store shows this worker holding the gateway-path job.
    async fn refresh_takeover(&self, job: &mut Job) -> bool {
        if job.bypasses_gateway() {
            return false;
        }
        let Some(store) = &self.store else { return false };
        match store.get_job(&job.id).await {
            Ok(Some(record)) => {
                if record.defensive_takeover {
                    info!(job_id = %job.id, "Job was taken over; routing report to the store");
                    job.mark_defensive_takeover();
                }
                record.is_assigned_to(&self.worker_id) && !record.status.is_terminal()
            }
            Ok(None) => false,
            Err(e) => {
                debug!(job_id = %job.id, error = %e, "Takeover check skipped");
                false
            }
        }
    }

    pub async fn report_complete(&self, job: &mut Job, result: JobResult) -> WorkerResult<CompletionRoute> {
        if !job.status.can_transition_to(JobStatus::Complete) {
            return Err(WorkerError::precondition(format!(
                "cannot complete job {} from {}",
                job.id, job.status
            )));
        }
        let holds_claim = self.refresh_takeover(job).await;

        if job.bypasses_gateway() {
            return self.write_direct(job, result).await;
        }

        let gateway = self
            .gateway
            .as_ref()
            .ok_or_else(|| WorkerError::config_error("gateway-path job without a gateway"))?;
        let acknowledged = match gateway.report_complete(&job.id, &result).await {
            Ok(()) => true,
            Err(e) if e.is_retryable() => {
                warn!(job_id = %job.id, error = %e, "Gateway completion report failed; tolerated");
                false
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            job_id = %job.id,
            hash = %result.content_address,
            acknowledged,
            "Completion reported to gateway"
        );
        if let (true, Some(store)) = (holds_claim, &self.store) {
            match store.write_result(&job.id, &result).await {
                Ok(written) => debug!(job_id = %job.id, written, "Store claim settled"),
                Err(e) => warn!(job_id = %job.id, error = %e, "Could not settle store claim"),
            }
        }
        job.complete(result)?;
        Ok(CompletionRoute::Gateway { acknowledged })
    }

    async fn write_direct(&self, job: &mut Job, result: JobResult) -> WorkerResult<CompletionRoute> {
        let store = self.store()?;
        let written = retry_async(
            &self.retry,
            || store.write_result(&job.id, &result),
            |e| e.is_transient(),
        )
        .await?;

        if written {
            info!(
                job_id = %job.id,
                hash = %result.content_address,
                path = %job.acquisition_path,
                "Completion written to store"
            );
            job.complete(result)?;
            return Ok(CompletionRoute::Direct);
        }

        match store.get_job(&job.id).await? {
            Some(record) if record.status == JobStatus::Complete => {
                info!(job_id = %job.id, "Store already holds a completed result");
                job.complete(record.result.unwrap_or(result))?;
                Ok(CompletionRoute::AlreadyComplete)
            }
            Some(record) => Err(WorkerError::precondition(format!(
                "store refused result for job {} in {}",
                job.id, record.status
            ))),
            None => Err(WorkerError::precondition(format!("job {} not in store", job.id))),
        }
    }

    /// Report a failed attempt. Direct-path jobs are released for retry.
    pub async fn report_failure(&self, job: &mut Job, error: &WorkerError) -> WorkerResult<FailureRoute> {
        let reason = error.to_string();
        record_failed(error.class());
        let holds_claim = self.refresh_takeover(job).await;

        let route = if job.bypasses_gateway() {
            let store = self.store()?;
            let outcome = retry_async(
                &self.retry,
                || store.release(&job.id, &self.worker_id, &reason, self.max_attempts),
                |e| e.is_transient(),
            )
            .await?;
            match outcome {
                ReleaseOutcome::Requeued { attempt_count } => {
                    info!(job_id = %job.id, attempt_count, class = error.class().as_str(), "Job released for retry");
                    FailureRoute::Requeued { attempt_count }
                }
                ReleaseOutcome::Failed { attempt_count } => {
                    warn!(job_id = %job.id, attempt_count, class = error.class().as_str(), "Job failed permanently");
                    FailureRoute::Failed { attempt_count }
                }
                ReleaseOutcome::NotOwner => {
                    info!(job_id = %job.id, "Job no longer held by this worker");
                    FailureRoute::NotOwner
                }
            }
        } else {
            let gateway = self
                .gateway
                .as_ref()
                .ok_or_else(|| WorkerError::config_error("gateway-path job without a gateway"))?;
            let acknowledged = match gateway.report_failed(&job.id, &reason).await {
                Ok(()) => true,
                Err(e) if e.is_retryable() => {
                    warn!(job_id = %job.id, error = %e, "Gateway failure report failed; tolerated");
                    false
                }
                Err(e) => return Err(e.into()),
            };
            if let (true, Some(store)) = (holds_claim, &self.store) {
                match store.release(&job.id, &self.worker_id, &reason, self.max_attempts).await {
                    Ok(outcome) => debug!(job_id = %job.id, ?outcome, "Store claim released"),
                    Err(e) => warn!(job_id = %job.id, error = %e, "Could not release store claim"),
                }
            }
            FailureRoute::Gateway { acknowledged }
        };

        if !job.is_terminal() {
            job.fail(reason)?;
        }
        Ok(route)
    }

    /// Operator path: write a result directly, bypassing gateway and queueing.
    ///
    /// Rejected with [`WorkerError::AlreadyComplete`] when the job is already complete.
    pub async fn force_complete(&self, id: &JobId, result: JobResult) -> WorkerResult<()> {
        let store = self.store()?;
        let record = store
            .get_job(id)
            .await?
            .ok_or_else(|| WorkerError::precondition(format!("job {} not found", id)))?;

        match record.status {
            JobStatus::Complete => return Err(WorkerError::AlreadyComplete(id.to_string())),
            JobStatus::Cancelled => {
                return Err(WorkerError::precondition(format!("job {} is cancelled", id)))
            }
            _ => {}
        }

        // Any worker still holding the job must now report to the store, where it will lose.
        store.mark_defensive_takeover(id).await?;
        if !store.write_result(id, &result).await? {
            return Err(WorkerError::AlreadyComplete(id.to_string()));
        }
        info!(
            job_id = %id,
            hash = %result.content_address,
            previous_status = %record.status,
            "Job force-completed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeGateway;
    use encnode_jobstore::{Claim, MemoryJobStore};
    use encnode_models::{AcquisitionPath, ContentAddress, JobDescription, JobSource};

    fn description() -> JobDescription {
        JobDescription::new(
            JobId::from_string("J1"),
            "ipfs://QmSource",
            JobSource::Gateway {
                owner: "alice".into(),
                permlink: "clip".into(),
                short: false,
            },
        )
    }

    fn result() -> JobResult {
        JobResult::new(ContentAddress::parse("QmOut").unwrap(), 10)
    }

    fn running(path: AcquisitionPath) -> Job {
        let mut job = Job::claimed(description(), path, "w1");
        if job.status == JobStatus::Assigned {
            job.transition(JobStatus::Running).unwrap();
        }
        job
    }

    #[tokio::test]
    async fn test_gateway_route_tolerates_server_errors() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.set_complete_status(Some(502));
        let reporter = CompletionReporter::new("w1", Some(gateway.clone()), None, 3);
        let mut job = running(AcquisitionPath::Gateway);

        let route = reporter.report_complete(&mut job, result()).await.unwrap();

        assert_eq!(route, CompletionRoute::Gateway { acknowledged: false });
        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!(gateway.completions().len(), 1);
    }

    #[tokio::test]
    async fn test_store_takeover_flag_is_sticky() {
        let store = Arc::new(MemoryJobStore::new());
        store.enqueue(description()).await.unwrap();
        let id = JobId::from_string("J1");
        store
            .conditional_claim(&id, &Claim::new("w1", AcquisitionPath::Gateway))
            .await
            .unwrap();
        store.mark_defensive_takeover(&id).await.unwrap();
        let gateway = Arc::new(FakeGateway::new());
        let reporter = CompletionReporter::new("w1", Some(gateway.clone()), Some(store.clone()), 3);
        let mut job = running(AcquisitionPath::Gateway);

        let route = reporter.report_complete(&mut job, result()).await.unwrap();

        assert_eq!(route, CompletionRoute::Direct);
        assert_eq!(gateway.total_calls(), 0);
        assert_eq!(
            store.get_job(&id).await.unwrap().unwrap().status,
            JobStatus::Complete
        );
    }

    #[tokio::test]
    async fn test_gateway_completion_settles_store_claim() {
        let store = Arc::new(MemoryJobStore::new());
        store.enqueue(description()).await.unwrap();
        let id = JobId::from_string("J1");
        store
            .conditional_claim(&id, &Claim::new("w1", AcquisitionPath::Gateway))
            .await
            .unwrap();
        let gateway = Arc::new(FakeGateway::new());
        let reporter = CompletionReporter::new("w1", Some(gateway.clone()), Some(store.clone()), 3);
        let mut job = running(AcquisitionPath::Gateway);

        let route = reporter.report_complete(&mut job, result()).await.unwrap();

        assert_eq!(route, CompletionRoute::Gateway { acknowledged: true });
        assert_eq!(gateway.completions().len(), 1);
        let record = store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Complete);
        assert!(!record.defensive_takeover);
    }

    #[tokio::test]
    async fn test_direct_failure_releases_claim() {
        let store = Arc::new(MemoryJobStore::new());
        store.enqueue(description()).await.unwrap();
        let id = JobId::from_string("J1");
        store
            .conditional_claim(&id, &Claim::new("w1", AcquisitionPath::Rescued))
            .await
            .unwrap();
        let reporter = CompletionReporter::new("w1", None, Some(store.clone()), 3);
        let mut job = running(AcquisitionPath::Rescued);

        let route = reporter
            .report_failure(&mut job, &WorkerError::encode_failed("bad input"))
            .await
            .unwrap();

        assert_eq!(route, FailureRoute::Requeued { attempt_count: 1 });
        let record = store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Queued);
        assert!(record.last_error.unwrap().contains("bad input"));
    }

    #[tokio::test]
    async fn test_force_complete_rejects_second_call() {
        let store = Arc::new(MemoryJobStore::new());
        store.enqueue(description()).await.unwrap();
        let reporter = CompletionReporter::new("operator", None, Some(store.clone()), 3);
        let id = JobId::from_string("J1");

        reporter.force_complete(&id, result()).await.unwrap();
        let second = reporter
            .force_complete(&id, JobResult::new(ContentAddress::parse("QmOther").unwrap(), 1))
            .await;

        assert!(matches!(second, Err(WorkerError::AlreadyComplete(_))));
        let record = store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(record.result.unwrap().content_address.as_str(), "QmOut");
    }
}
