//! Scriptable fakes for the gateway and encoder, and a fully wired fixture, used by tests.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use encnode_gateway::{Gateway, GatewayError, GatewayResult};
use encnode_jobstore::MemoryJobStore;
use encnode_models::{JobDescription, JobId, JobResult, TargetNode};
use encnode_storage::testing::FakeNode;
use encnode_storage::{FallbackLedger, LocalPinStore, PinDriver, TankConfig, TankEngine, TieredNode};

use crate::config::WorkerConfig;
use crate::coordinator::Coordinator;
use crate::encode_cache::EncodeCache;
use crate::encoder::{EncodeRequest, EncodedOutput, Encoder, ProgressFn, VARIANT_PLAYLIST};
use crate::error::{WorkerError, WorkerResult};
use crate::processor::JobProcessor;
use crate::reporter::CompletionReporter;

/// One call observed by [`FakeGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Poll,
    Accept(JobId),
    Progress(JobId, u8),
    Complete(JobId, JobResult),
    Failed(JobId, String),
}

#[derive(Default)]
struct GatewayState {
    jobs: VecDeque<JobDescription>,
    poll_status: Option<u16>,
    accept_status: Option<u16>,
    complete_status: Option<u16>,
    calls: Vec<GatewayCall>,
}

/// In-memory gateway. Non-success statuses are scripted per operation.
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<GatewayState>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut GatewayState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn push_job(&self, job: JobDescription) {
        self.with_state(|s| s.jobs.push_back(job));
    }

    /// Fail polls with this HTTP status (`None` restores success).
    pub fn set_poll_status(&self, status: Option<u16>) {
        self.with_state(|s| s.poll_status = status);
    }

    pub fn set_accept_status(&self, status: Option<u16>) {
        self.with_state(|s| s.accept_status = status);
    }

    pub fn set_complete_status(&self, status: Option<u16>) {
        self.with_state(|s| s.complete_status = status);
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.with_state(|s| s.calls.clone())
    }

    pub fn total_calls(&self) -> usize {
        self.with_state(|s| s.calls.len())
    }

    /// Calls that write job state (everything except polling).
    pub fn write_calls(&self) -> usize {
        self.with_state(|s| s.calls.iter().filter(|c| **c != GatewayCall::Poll).count())
    }

    pub fn progress_reports(&self) -> Vec<u8> {
        self.with_state(|s| {
            s.calls
                .iter()
                .filter_map(|c| match c {
                    GatewayCall::Progress(_, pct) => Some(*pct),
                    _ => None,
                })
                .collect()
        })
    }

    pub fn completions(&self) -> Vec<(JobId, JobResult)> {
        self.with_state(|s| {
            s.calls
                .iter()
                .filter_map(|c| match c {
                    GatewayCall::Complete(id, result) => Some((id.clone(), result.clone())),
                    _ => None,
                })
                .collect()
        })
    }

    fn record(&self, call: GatewayCall, status: impl FnOnce(&GatewayState) -> Option<u16>) -> GatewayResult<()> {
        self.with_state(|s| {
            s.calls.push(call);
            match status(s) {
                Some(code) => Err(GatewayError::from_http_status(code, "scripted failure")),
                None => Ok(()),
            }
        })
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn poll_next_job(&self) -> GatewayResult<Option<JobDescription>> {
        self.record(GatewayCall::Poll, |s| s.poll_status)?;
        Ok(self.with_state(|s| s.jobs.pop_front()))
    }

    async fn accept_job(&self, id: &JobId) -> GatewayResult<()> {
        self.record(GatewayCall::Accept(id.clone()), |s| s.accept_status)
    }

    async fn report_progress(&self, id: &JobId, percent: u8) -> GatewayResult<()> {
        self.record(GatewayCall::Progress(id.clone(), percent), |_| None)
    }

    async fn report_complete(&self, id: &JobId, result: &JobResult) -> GatewayResult<()> {
        self.record(GatewayCall::Complete(id.clone(), result.clone()), |s| {
            s.complete_status
        })
    }

    async fn report_failed(&self, id: &JobId, reason: &str) -> GatewayResult<()> {
        self.record(GatewayCall::Failed(id.clone(), reason.to_string()), |_| None)
    }
}

/// Encoder that writes a one-segment HLS rendition.
#[derive(Default)]
pub struct FakeEncoder {
    calls: AtomicU32,
    fail: std::sync::atomic::AtomicBool,
}

impl FakeEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Encoder for FakeEncoder {
    async fn encode(&self, request: &EncodeRequest, progress: ProgressFn) -> WorkerResult<EncodedOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(WorkerError::encode_failed("scripted encoder failure"));
        }
        tokio::fs::create_dir_all(&request.output_dir).await?;
        tokio::fs::write(
            request.output_dir.join(VARIANT_PLAYLIST),
            "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXTINF:6.0,\nsegment_000.ts\n#EXT-X-ENDLIST\n",
        )
        .await?;
        tokio::fs::write(request.output_dir.join("segment_000.ts"), request.profile.name.as_bytes()).await?;
        progress(100);
        Ok(EncodedOutput {
            dir: request.output_dir.clone(),
            playlist: VARIANT_PLAYLIST.to_string(),
            profile: request.profile.clone(),
        })
    }
}

/// A worker wired over in-memory fakes, rooted at a scratch directory.
///
/// Nodes: `primary`, one `secondary` and `local`. Local fallback follows
/// `config.tank.local_fallback_enabled`.
pub struct Fixture {
    pub config: WorkerConfig,
    pub store: Arc<MemoryJobStore>,
    pub gateway: Arc<FakeGateway>,
    pub encoder: Arc<FakeEncoder>,
    pub primary: Arc<FakeNode>,
    pub secondary: Arc<FakeNode>,
    pub local: Arc<FakeNode>,
}

impl Fixture {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        let config = WorkerConfig {
            worker_id: "worker-a".to_string(),
            max_concurrent_jobs: 4,
            work_dir: work_dir.into(),
            encode_cache_max_entries: 8,
            tank: TankConfig {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                ..TankConfig::default()
            },
            ..WorkerConfig::default()
        };
        let primary = Arc::new(FakeNode::new("primary"));
        primary.set_upload_cid("QmOutput");
        Self {
            config,
            store: Arc::new(MemoryJobStore::new()),
            gateway: Arc::new(FakeGateway::new()),
            encoder: Arc::new(FakeEncoder::new()),
            primary,
            secondary: Arc::new(FakeNode::new("secondary")),
            local: Arc::new(FakeNode::new("local")),
        }
    }

    pub async fn tank(&self) -> WorkerResult<Arc<TankEngine>> {
        tokio::fs::create_dir_all(self.config.state_dir()).await?;
        let ledger = Arc::new(FallbackLedger::new(self.config.ledger_path()));
        let local_store = Arc::new(LocalPinStore::open(self.config.local_pins_path()).await?);
        let tank = TankEngine::new(
            self.config.tank.clone(),
            TieredNode::new(TargetNode::Primary, "primary", self.primary.clone()),
            PinDriver::default(),
        )
        .with_secondaries(vec![TieredNode::new(
            TargetNode::Secondary,
            "secondary",
            self.secondary.clone(),
        )])
        .with_local(TieredNode::new(TargetNode::Local, "local", self.local.clone()))
        .with_local_archive(ledger, local_store);
        Ok(Arc::new(tank))
    }

    pub fn reporter(&self) -> Arc<CompletionReporter> {
        Arc::new(CompletionReporter::new(
            self.config.worker_id.clone(),
            Some(self.gateway.clone()),
            Some(self.store.clone()),
            self.config.job_max_attempts,
        ))
    }

    pub async fn processor(&self) -> WorkerResult<Arc<JobProcessor>> {
        let cache = EncodeCache::open(self.config.cache_dir(), self.config.encode_cache_max_entries).await?;
        let processor = JobProcessor::new(
            self.config.worker_id.clone(),
            self.config.jobs_dir(),
            self.encoder.clone(),
            Arc::new(cache),
            self.tank().await?,
            self.reporter(),
        )
        .with_store(self.store.clone())
        .with_gateway(self.gateway.clone());
        Ok(Arc::new(processor))
    }

    pub async fn coordinator(&self) -> WorkerResult<Arc<Coordinator>> {
        let coordinator = Coordinator::new(self.config.clone(), self.processor().await?)
            .with_gateway(self.gateway.clone())
            .with_store(self.store.clone());
        Ok(Arc::new(coordinator))
    }
}
