//! Per-job processing: encode every rendition, persist the output directory,
//! then report completion.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn, Instrument};

use encnode_gateway::Gateway;
use encnode_jobstore::JobStore;
use encnode_models::{EncodingProfile, Job, JobId, JobResult, JobStatus};
use encnode_storage::{LazyPinQueue, PersistHealth, TankEngine};

use crate::encode_cache::{copy_dir, CacheKey, EncodeCache};
use crate::encoder::{EncodeRequest, EncodedOutput, Encoder, ProgressFn, VARIANT_PLAYLIST};
use crate::error::{FailureClass, WorkerError, WorkerResult};
use crate::metrics::{record_completed, record_race_lost};
use crate::reporter::{CompletionReporter, CompletionRoute, FailureRoute};
use crate::state_machine::{JobDriver, Precheck};

/// How processing of one job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed {
        result: JobResult,
        route: CompletionRoute,
        /// `None` when pinning was deferred to the lazy queue
        health: Option<PersistHealth>,
    },
    /// Another worker or an operator finished or holds the job
    AlreadyHandled(String),
    Failed {
        class: FailureClass,
        error: String,
        route: Option<FailureRoute>,
    },
}

impl JobOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, JobOutcome::Completed { .. })
    }
}

struct Completion {
    result: JobResult,
    route: CompletionRoute,
    health: Option<PersistHealth>,
}

pub struct JobProcessor {
    worker_id: String,
    jobs_dir: PathBuf,
    encoder: Arc<dyn Encoder>,
    cache: Arc<EncodeCache>,
    tank: Arc<TankEngine>,
    reporter: Arc<CompletionReporter>,
    lazy: Option<Arc<LazyPinQueue>>,
    store: Option<Arc<dyn JobStore>>,
    gateway: Option<Arc<dyn Gateway>>,
}

impl JobProcessor {
    pub fn new(
        worker_id: impl Into<String>,
        jobs_dir: impl Into<PathBuf>,
        encoder: Arc<dyn Encoder>,
        cache: Arc<EncodeCache>,
        tank: Arc<TankEngine>,
        reporter: Arc<CompletionReporter>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            jobs_dir: jobs_dir.into(),
            encoder,
            cache,
            tank,
            reporter,
            lazy: None,
            store: None,
            gateway: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn Gateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Complete after upload and leave pinning to the queue.
    pub fn with_lazy_queue(mut self, queue: Arc<LazyPinQueue>) -> Self {
        self.lazy = Some(queue);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }

    pub fn reporter(&self) -> &Arc<CompletionReporter> {
        &self.reporter
    }

    /// Drive one acquired job to a terminal outcome. Never panics on job errors.
    pub async fn process(&self, job: Job) -> JobOutcome {
        let driver = JobDriver::new(job, self.worker_id.clone(), self.store.clone(), self.gateway.clone());
        let span = driver.logger().create_span();
        self.process_inner(driver).instrument(span).await
    }

    async fn process_inner(&self, mut driver: JobDriver) -> JobOutcome {
        let started = Instant::now();
        let job_dir = self.jobs_dir.join(driver.job().id.as_str());

        match driver.precheck().await {
            Ok(Precheck::Proceed) => {}
            Ok(Precheck::AlreadyHandled(reason)) => {
                info!(reason = %reason, "Skipping job handled elsewhere");
                return JobOutcome::AlreadyHandled(reason);
            }
            Err(e) => return self.fail(&mut driver, e).await,
        }

        driver.logger().log_start(&driver.job().input_ref);
        let outcome = match self.run(&mut driver, &job_dir).await {
            Ok(done) => {
                record_completed(done.route.as_str(), started.elapsed().as_secs_f64());
                driver.logger().log_completion(&format!(
                    "{} via {}",
                    done.result.content_address,
                    done.route.as_str()
                ));
                JobOutcome::Completed {
                    result: done.result,
                    route: done.route,
                    health: done.health,
                }
            }
            Err(e) if e.is_race_lost() => {
                record_race_lost(driver.job().acquisition_path);
                info!(error = %e, "Lost job to another worker");
                JobOutcome::AlreadyHandled(e.to_string())
            }
            Err(WorkerError::AlreadyComplete(id)) => {
                info!(job_id = %id, "Job completed elsewhere");
                JobOutcome::AlreadyHandled(format!("job {} is already complete", id))
            }
            Err(e) => self.fail(&mut driver, e).await,
        };

        if let Err(e) = tokio::fs::remove_dir_all(&job_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %job_dir.display(), error = %e, "Failed to remove job directory");
            }
        }
        outcome
    }

    async fn fail(&self, driver: &mut JobDriver, error: WorkerError) -> JobOutcome {
        let class = error.class();
        driver.logger().log_error(&format!("{} ({})", error, class.as_str()));
        let route = match self.reporter.report_failure(driver.job_mut(), &error).await {
            Ok(route) => Some(route),
            Err(e) => {
                warn!(error = %e, "Failure report did not reach the store or gateway");
                None
            }
        };
        JobOutcome::Failed {
            class,
            error: error.to_string(),
            route,
        }
    }

    async fn run(&self, driver: &mut JobDriver, job_dir: &Path) -> WorkerResult<Completion> {
        let (id, input_ref, profiles, max_duration) = {
            let job = driver.job();
            (
                job.id.clone(),
                job.input_ref.clone(),
                job.source.select_profiles(&job.profiles)?,
                job.source.duration_limit_secs(),
            )
        };

        driver.advance(JobStatus::Downloading).await?;
        driver.advance(JobStatus::Running).await?;

        let out_dir = job_dir.join("out");
        tokio::fs::create_dir_all(&out_dir).await?;
        let mut variants = Vec::with_capacity(profiles.len());
        for profile in &profiles {
            let variant = self
                .encode_profile(&id, &input_ref, profile, max_duration, job_dir, &out_dir)
                .await?;
            variants.push(variant);
        }
        write_master_playlist(&out_dir, &variants).await?;

        driver.advance(JobStatus::Uploading).await?;

        let (record, health) = match &self.lazy {
            Some(queue) => {
                let record = self.tank.upload(&id, &out_dir).await?;
                queue.enqueue(record.clone()).await?;
                debug!(hash = %record.hash, "Pin deferred to lazy queue");
                (record, None)
            }
            None => {
                let outcome = self.tank.persist_artifact(&id, &out_dir).await?;
                if outcome.health == PersistHealth::Degraded {
                    driver.logger().log_warning(&format!(
                        "persisted on {} only",
                        outcome.record.target_node.as_str()
                    ));
                }
                (outcome.record, Some(outcome.health))
            }
        };

        let result = JobResult::new(record.hash.clone(), record.size_bytes);
        let route = self
            .reporter
            .report_complete(driver.job_mut(), result.clone())
            .await?;
        Ok(Completion { result, route, health })
    }

    async fn encode_profile(
        &self,
        id: &JobId,
        input_ref: &str,
        profile: &EncodingProfile,
        max_duration: Option<u32>,
        job_dir: &Path,
        out_dir: &Path,
    ) -> WorkerResult<EncodedOutput> {
        let key = CacheKey::new(input_ref, profile, max_duration);
        let dest = out_dir.join(&profile.name);

        if let Some(cached) = self.cache.get(&key).await {
            copy_dir(&cached, &dest).await?;
            info!(profile = %profile.name, "Rendition served from encode cache");
            return Ok(EncodedOutput {
                dir: dest,
                playlist: VARIANT_PLAYLIST.to_string(),
                profile: profile.clone(),
            });
        }

        let request = EncodeRequest {
            source_ref: input_ref.to_string(),
            profile: profile.clone(),
            output_dir: job_dir.join("encode").join(&profile.name),
            max_duration_secs: max_duration,
        };
        let progress: ProgressFn = {
            let id = id.clone();
            let name = profile.name.clone();
            Arc::new(move |percent| debug!(job_id = %id, profile = %name, percent, "Encode progress"))
        };
        let produced = self.encoder.encode(&request, progress).await?;
        let stored = self.cache.insert(&key, &produced.dir).await?;
        copy_dir(&stored, &dest).await?;

        Ok(EncodedOutput {
            dir: dest,
            playlist: produced.playlist,
            profile: profile.clone(),
        })
    }
}

/// Write the HLS master playlist referencing each rendition's playlist.
async fn write_master_playlist(out_dir: &Path, variants: &[EncodedOutput]) -> WorkerResult<PathBuf> {
    let mut manifest = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    for variant in variants {
        let profile = &variant.profile;
        let bandwidth =
            (u64::from(profile.video_bitrate_kbps) + u64::from(profile.audio_bitrate_kbps)) * 1000;
        // 16:9, rounded down to an even width
        let width = (u64::from(profile.height) * 16 / 9) & !1;
        manifest.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{},NAME=\"{}\"\n{}/{}\n",
            bandwidth, width, profile.height, profile.name, profile.name, variant.playlist
        ));
    }
    let path = out_dir.join(JobResult::MASTER_PLAYLIST);
    tokio::fs::write(&path, manifest).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeEncoder, FakeGateway, GatewayCall};
    use encnode_jobstore::{JobRecord, MemoryJobStore};
    use encnode_models::{AcquisitionPath, JobDescription, JobSource, TargetNode};
    use encnode_storage::testing::FakeNode;
    use encnode_storage::{PinDriver, TankConfig, TieredNode};
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        encoder: Arc<FakeEncoder>,
        gateway: Arc<FakeGateway>,
        store: Arc<MemoryJobStore>,
        primary: Arc<FakeNode>,
        processor: JobProcessor,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let encoder = Arc::new(FakeEncoder::new());
        let gateway = Arc::new(FakeGateway::new());
        let store = Arc::new(MemoryJobStore::new());
        let primary = Arc::new(FakeNode::new("primary"));
        primary.set_upload_cid("QmOutput");
        let tank = TankEngine::new(
            TankConfig::default(),
            TieredNode::new(TargetNode::Primary, "primary", primary.clone()),
            PinDriver::default(),
        );
        let cache = EncodeCache::open(dir.path().join("cache"), 8).await.unwrap();
        let reporter = CompletionReporter::new("w1", Some(gateway.clone()), Some(store.clone()), 3);
        let processor = JobProcessor::new(
            "w1",
            dir.path().join("jobs"),
            encoder.clone(),
            Arc::new(cache),
            Arc::new(tank),
            Arc::new(reporter),
        )
        .with_store(store.clone())
        .with_gateway(gateway.clone());
        Harness {
            _dir: dir,
            encoder,
            gateway,
            store,
            primary,
            processor,
        }
    }

    fn description(id: &str) -> JobDescription {
        JobDescription::new(
            JobId::from_string(id),
            "ipfs://QmSource",
            JobSource::Gateway {
                owner: "alice".into(),
                permlink: id.into(),
                short: false,
            },
        )
        .with_profiles(vec![EncodingProfile::p720(), EncodingProfile::p480()])
    }

    fn gateway_job(id: &str) -> Job {
        Job::claimed(description(id), AcquisitionPath::Gateway, "w1")
    }

    #[tokio::test]
    async fn test_gateway_job_completes_through_gateway() {
        let h = harness().await;

        let outcome = h.processor.process(gateway_job("J1")).await;

        match outcome {
            JobOutcome::Completed { result, route, health } => {
                assert_eq!(result.content_address.as_str(), "QmOutput");
                assert_eq!(route, CompletionRoute::Gateway { acknowledged: true });
                assert_eq!(health, Some(PersistHealth::Healthy));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(h.encoder.calls(), 2);
        assert_eq!(h.gateway.progress_reports(), vec![10, 30, 80]);
        assert_eq!(h.gateway.completions().len(), 1);
        assert_eq!(h.primary.upload_calls(), 1);
        assert!(!h.processor.jobs_dir().join("J1").exists());
    }

    #[tokio::test]
    async fn test_second_job_reuses_cached_renditions() {
        let h = harness().await;

        assert!(h.processor.process(gateway_job("J1")).await.is_completed());
        assert!(h.processor.process(gateway_job("J2")).await.is_completed());

        assert_eq!(h.encoder.calls(), 2);
    }

    #[tokio::test]
    async fn test_encoder_failure_reports_to_gateway() {
        let h = harness().await;
        h.encoder.set_fail(true);

        let outcome = h.processor.process(gateway_job("J1")).await;

        assert!(matches!(
            outcome,
            JobOutcome::Failed {
                class: FailureClass::ExhaustionCritical,
                route: Some(FailureRoute::Gateway { acknowledged: true }),
                ..
            }
        ));
        assert!(h
            .gateway
            .calls()
            .iter()
            .any(|c| matches!(c, GatewayCall::Failed(id, _) if id.as_str() == "J1")));
        assert_eq!(h.primary.upload_calls(), 0);
    }

    #[tokio::test]
    async fn test_completed_job_is_not_processed_again() {
        let h = harness().await;
        let mut record = JobRecord::queued(description("J1"));
        record.status = JobStatus::Complete;
        h.store.insert(record).await;

        let outcome = h.processor.process(gateway_job("J1")).await;

        assert!(matches!(outcome, JobOutcome::AlreadyHandled(_)));
        assert_eq!(h.encoder.calls(), 0);
        assert_eq!(h.gateway.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_master_playlist_lists_every_rendition() {
        let dir = TempDir::new().unwrap();
        let variants = vec![
            EncodedOutput {
                dir: dir.path().join("720p"),
                playlist: VARIANT_PLAYLIST.to_string(),
                profile: EncodingProfile::p720(),
            },
            EncodedOutput {
                dir: dir.path().join("480p"),
                playlist: VARIANT_PLAYLIST.to_string(),
                profile: EncodingProfile::p480(),
            },
        ];

        let path = write_master_playlist(dir.path(), &variants).await.unwrap();
        let manifest = tokio::fs::read_to_string(path).await.unwrap();

        assert!(manifest.starts_with("#EXTM3U"));
        assert!(manifest.contains("RESOLUTION=1280x720"));
        assert!(manifest.contains("720p/index.m3u8"));
        assert!(manifest.contains("480p/index.m3u8"));
    }

    #[tokio::test]
    async fn test_master_playlist_handles_oversized_profiles() {
        let dir = TempDir::new().unwrap();
        let variants = vec![EncodedOutput {
            dir: dir.path().join("huge"),
            playlist: VARIANT_PLAYLIST.to_string(),
            profile: EncodingProfile {
                name: "huge".to_string(),
                height: u32::MAX,
                video_bitrate_kbps: u32::MAX,
                audio_bitrate_kbps: u32::MAX,
            },
        }];

        let path = write_master_playlist(dir.path(), &variants).await.unwrap();
        let manifest = tokio::fs::read_to_string(path).await.unwrap();

        let bandwidth = (u64::from(u32::MAX) * 2) * 1000;
        let width = (u64::from(u32::MAX) * 16 / 9) & !1;
        assert!(manifest.contains(&format!("BANDWIDTH={bandwidth},")));
        assert!(manifest.contains(&format!("RESOLUTION={width}x{}", u32::MAX)));
    }
}
