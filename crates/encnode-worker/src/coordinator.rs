//! Job acquisition coordinator.
//!
//! Two independent loops feed the processor: gateway polling and the rescue
//! scan over the store. Neither keeps local claim state; when a store is
//! configured every acquisition, gateway hand-outs included, ends in a
//! conditional claim there.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use encnode_gateway::{Gateway, GatewayError};
use encnode_jobstore::{Claim, JobRecord, JobStore};
use encnode_models::{AcquisitionPath, Job, JobDescription, JobId};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::metrics::{record_acquired, record_poll_error, record_race_lost, record_rescue_cycle};
use crate::processor::{JobOutcome, JobProcessor};
use crate::retry::FailureTracker;

/// What one rescue scan did.
#[derive(Debug, Default)]
pub struct RescueReport {
    /// Abandoned jobs the store returned
    pub candidates: usize,
    /// Jobs this worker won
    pub claimed: Vec<Job>,
    /// Claims another worker got first
    pub race_lost: usize,
}

pub struct Coordinator {
    config: WorkerConfig,
    processor: Arc<JobProcessor>,
    gateway: Option<Arc<dyn Gateway>>,
    store: Option<Arc<dyn JobStore>>,
    job_semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl Coordinator {
    pub fn new(config: WorkerConfig, processor: Arc<JobProcessor>) -> Self {
        let job_semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            processor,
            gateway: None,
            store: None,
            job_semaphore,
            shutdown,
        }
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn Gateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Free job slots.
    pub fn available_slots(&self) -> usize {
        self.job_semaphore.available_permits()
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Ask the gateway for one job, accept it and claim it in the store.
    pub async fn poll_once(&self) -> WorkerResult<Option<Job>> {
        let Some(gateway) = &self.gateway else {
            return Ok(None);
        };
        let Some(description) = gateway.poll_next_job().await? else {
            return Ok(None);
        };
        let id = description.id.clone();

        let record = self.store_record(&id).await;
        if let Some(record) = &record {
            if record.defensive_takeover {
                info!(job_id = %id, status = %record.status, "Gateway offered a taken-over job; not accepting");
                return Ok(None);
            }
            if !record.status.is_claimable() && !record.is_assigned_to(self.worker_id()) {
                record_race_lost(AcquisitionPath::Gateway);
                info!(
                    job_id = %id,
                    status = %record.status,
                    assigned_worker = record.assigned_worker.as_deref().unwrap_or("none"),
                    "Gateway offered a job the store shows as handled; not accepting"
                );
                return Ok(None);
            }
        }

        match gateway.accept_job(&id).await {
            Ok(()) => self.claim_accepted(description, record).await,
            Err(GatewayError::Conflict(reason)) => {
                record_race_lost(AcquisitionPath::Gateway);
                info!(job_id = %id, reason = %reason, "Gateway gave the job to another worker");
                Ok(None)
            }
            Err(e) if e.is_retryable() => self.resolve_unaccepted(description, &e).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Current store record, if there is a store and it answers.
    async fn store_record(&self, id: &JobId) -> Option<JobRecord> {
        let store = self.store.as_ref()?;
        match store.get_job(id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(job_id = %id, error = %e, "Store unavailable for gateway offer check");
                None
            }
        }
    }

    /// Gateway acceptance succeeded; the store claim decides against rescue scans.
    async fn claim_accepted(
        &self,
        description: JobDescription,
        record: Option<JobRecord>,
    ) -> WorkerResult<Option<Job>> {
        let id = description.id.clone();
        if let (Some(store), Some(record)) = (&self.store, record) {
            if !record.is_assigned_to(self.worker_id()) {
                let claim = Claim::new(self.worker_id(), AcquisitionPath::Gateway);
                match store.conditional_claim(&id, &claim).await {
                    Ok(true) => debug!(job_id = %id, "Gateway job claimed in store"),
                    Ok(false) => {
                        record_race_lost(AcquisitionPath::Gateway);
                        info!(job_id = %id, "Store claim lost after gateway accept; dropping job");
                        return Ok(None);
                    }
                    Err(e) => {
                        warn!(job_id = %id, error = %e, "Store claim unavailable; relying on gateway acceptance")
                    }
                }
            }
        }

        record_acquired(AcquisitionPath::Gateway);
        info!(job_id = %id, "Accepted job from gateway");
        Ok(Some(Job::claimed(
            description,
            AcquisitionPath::Gateway,
            self.worker_id(),
        )))
    }

    /// The gateway handed out a job but acceptance never went through; let the store decide.
    async fn resolve_unaccepted(
        &self,
        description: JobDescription,
        cause: &GatewayError,
    ) -> WorkerResult<Option<Job>> {
        let id = description.id.clone();
        let Some(store) = &self.store else {
            warn!(job_id = %id, error = %cause, "Accept failed and no store to verify against; skipping");
            return Ok(None);
        };

        let record = match store.get_job(&id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(job_id = %id, error = %cause, "Accept failed and store does not know the job; skipping");
                return Ok(None);
            }
            Err(e) => {
                warn!(job_id = %id, error = %e, "Accept failed and store unavailable; skipping");
                return Ok(None);
            }
        };

        if record.is_assigned_to(self.worker_id()) && !record.status.is_terminal() {
            store.mark_defensive_takeover(&id).await?;
            let mut job = Job::claimed(
                record.description,
                AcquisitionPath::MongoVerified,
                self.worker_id(),
            );
            job.mark_defensive_takeover();
            record_acquired(AcquisitionPath::MongoVerified);
            info!(
                job_id = %id,
                status = %record.status,
                error = %cause,
                "Accept failed but store confirms assignment; proceeding without gateway"
            );
            return Ok(Some(job));
        }

        if record.status.is_claimable() && record.assigned_worker.is_none() {
            let claim = Claim::new(self.worker_id(), AcquisitionPath::DefensiveTakeover);
            if store.conditional_claim(&id, &claim).await? {
                record_acquired(AcquisitionPath::DefensiveTakeover);
                info!(job_id = %id, error = %cause, "Accept failed; claimed job through the store");
                return Ok(Some(Job::claimed(
                    record.description,
                    AcquisitionPath::DefensiveTakeover,
                    self.worker_id(),
                )));
            }
            record_race_lost(AcquisitionPath::DefensiveTakeover);
            info!(job_id = %id, "Defensive claim lost to another worker");
            return Ok(None);
        }

        info!(
            job_id = %id,
            status = %record.status,
            assigned_worker = record.assigned_worker.as_deref().unwrap_or("none"),
            "Accept failed and job is not ours to take; skipping"
        );
        Ok(None)
    }

    /// Claim abandoned `queued` jobs, oldest first, bounded per cycle and by free slots.
    pub async fn rescue_cycle(&self) -> WorkerResult<RescueReport> {
        let mut report = RescueReport::default();
        let Some(store) = &self.store else {
            return Ok(report);
        };
        record_rescue_cycle();

        let budget = self
            .config
            .rescue
            .max_per_cycle
            .min(self.job_semaphore.available_permits());
        if budget == 0 {
            debug!("Rescue scan skipped, no free slots");
            return Ok(report);
        }

        let threshold = self.config.rescue.abandoned_threshold;
        let candidates = store
            .find_queued_older_than(threshold, self.config.rescue.max_per_cycle.saturating_mul(4))
            .await?;
        report.candidates = candidates.len();

        let now = Utc::now();
        for record in candidates {
            if report.claimed.len() >= budget {
                break;
            }
            let id = record.id().clone();
            let age_secs = (now - record.created_at()).num_seconds();
            let claim = Claim::new(self.worker_id(), AcquisitionPath::Rescued);
            match store.conditional_claim(&id, &claim).await {
                Ok(true) => {
                    record_acquired(AcquisitionPath::Rescued);
                    info!(
                        job_id = %id,
                        age_secs,
                        attempt_count = record.attempt_count,
                        "Rescued abandoned job"
                    );
                    report.claimed.push(Job::claimed(
                        record.description,
                        AcquisitionPath::Rescued,
                        self.worker_id(),
                    ));
                }
                Ok(false) => {
                    record_race_lost(AcquisitionPath::Rescued);
                    report.race_lost += 1;
                    info!(job_id = %id, age_secs, "Rescue claim lost to another worker");
                }
                Err(e) => {
                    warn!(job_id = %id, error = %e, "Rescue claim failed");
                }
            }
        }

        if report.candidates > 0 {
            info!(
                candidates = report.candidates,
                claimed = report.claimed.len(),
                race_lost = report.race_lost,
                "Rescue scan finished"
            );
        }
        Ok(report)
    }

    /// Run a job on a free slot, waiting for one if needed.
    pub async fn dispatch(&self, job: Job) -> WorkerResult<JoinHandle<JobOutcome>> {
        let permit = self
            .job_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::config_error("job semaphore closed"))?;
        let processor = Arc::clone(&self.processor);

        Ok(tokio::spawn(async move {
            let _permit = permit;
            let id = job.id.clone();
            let outcome = processor.process(job).await;
            match &outcome {
                JobOutcome::Completed { result, route, .. } => {
                    info!(job_id = %id, hash = %result.content_address, route = route.as_str(), "Job finished")
                }
                JobOutcome::AlreadyHandled(reason) => {
                    info!(job_id = %id, reason = %reason, "Job handled elsewhere")
                }
                JobOutcome::Failed { class, error, .. } => {
                    error!(job_id = %id, class = class.as_str(), error = %error, "Job failed")
                }
            }
            outcome
        }))
    }

    /// Run both acquisition loops until shutdown, then drain in-flight jobs.
    pub async fn run(self: &Arc<Self>) -> WorkerResult<()> {
        info!(
            worker_id = %self.worker_id(),
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            gateway = self.gateway.is_some(),
            rescue = self.config.rescue.enabled && self.store.is_some(),
            "Starting acquisition coordinator"
        );

        let rescue_task = if self.config.rescue.enabled && self.store.is_some() {
            Some(tokio::spawn(Arc::clone(self).rescue_loop()))
        } else {
            None
        };

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut failures = FailureTracker::new(3);
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping acquisition");
                        break;
                    }
                }
                _ = interval.tick(), if self.gateway.is_some() => {
                    if self.job_semaphore.available_permits() == 0 {
                        continue;
                    }
                    match self.poll_once().await {
                        Ok(Some(job)) => {
                            failures.record_success();
                            if let Err(e) = self.dispatch(job).await {
                                error!(error = %e, "Failed to dispatch job");
                            }
                        }
                        Ok(None) => failures.record_success(),
                        Err(e) => {
                            record_poll_error();
                            if failures.record_failure() {
                                warn!(error = %e, failures = failures.failure_count(), "Gateway poll failed");
                            }
                        }
                    }
                }
            }
        }

        if let Some(task) = rescue_task {
            if tokio::time::timeout(self.config.shutdown_timeout, task).await.is_err() {
                warn!("Rescue loop did not stop in time");
            }
        }

        info!("Waiting for in-flight jobs to complete...");
        if tokio::time::timeout(self.config.shutdown_timeout, self.wait_for_jobs())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.config.max_concurrent_jobs - self.job_semaphore.available_permits(),
                "Shutdown timeout reached with jobs still running"
            );
        }

        info!("Acquisition coordinator stopped");
        Ok(())
    }

    async fn rescue_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut interval = tokio::time::interval(self.config.rescue.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut failures = FailureTracker::new(3);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    match self.rescue_cycle().await {
                        Ok(report) => {
                            failures.record_success();
                            for job in report.claimed {
                                if let Err(e) = self.dispatch(job).await {
                                    error!(error = %e, "Failed to dispatch rescued job");
                                }
                            }
                        }
                        Err(e) => {
                            if failures.record_failure() {
                                warn!(error = %e, "Rescue scan failed");
                            }
                        }
                    }
                }
            }
        }
    }

    /// Wait for all in-flight jobs to complete.
    async fn wait_for_jobs(&self) {
        loop {
            if self.job_semaphore.available_permits() == self.config.max_concurrent_jobs {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
