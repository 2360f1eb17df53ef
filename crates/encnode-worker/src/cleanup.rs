//! Periodic housekeeping: local pin reconciliation, encode cache pruning and
//! removal of job directories left behind by crashed runs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use encnode_storage::{LocalPinStore, PersistenceVerifier, TieredNode};

use crate::encode_cache::EncodeCache;
use crate::error::WorkerResult;

/// Job directories untouched for this long are considered orphaned.
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    /// Local pins confirmed on the remote node
    pub synced: usize,
    /// Local pins unpinned and dropped
    pub pruned: usize,
    pub cache_removed: usize,
    pub job_dirs_removed: usize,
}

struct LocalPins {
    store: Arc<LocalPinStore>,
    remote: TieredNode,
    local: TieredNode,
}

pub struct CleanupTask {
    interval: Duration,
    jobs_dir: PathBuf,
    stale_after: Duration,
    cache: Option<Arc<EncodeCache>>,
    local_pins: Option<LocalPins>,
    verifier: PersistenceVerifier,
}

impl CleanupTask {
    pub fn new(interval: Duration, jobs_dir: impl Into<PathBuf>) -> Self {
        Self {
            interval,
            jobs_dir: jobs_dir.into(),
            stale_after: DEFAULT_STALE_AFTER,
            cache: None,
            local_pins: None,
            verifier: PersistenceVerifier::default(),
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_cache(mut self, cache: Arc<EncodeCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Reconcile local pins against `remote` and unpin synced ones from `local`.
    pub fn with_local_pins(mut self, store: Arc<LocalPinStore>, remote: TieredNode, local: TieredNode) -> Self {
        self.local_pins = Some(LocalPins { store, remote, local });
        self
    }

    pub fn with_verifier(mut self, verifier: PersistenceVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    let report = self.run_once().await;
                    debug!(?report, "Cleanup pass finished");
                }
            }
        }
    }

    /// One pass. Each step logs its own failure and does not stop the others.
    pub async fn run_once(&self) -> CleanupReport {
        let mut report = CleanupReport::default();

        if let Some(pins) = &self.local_pins {
            match pins.store.reconcile(&self.verifier, &pins.remote, &pins.local).await {
                Ok(n) => report.synced = n,
                Err(e) => warn!(error = %e, "Local pin reconciliation failed"),
            }
            match pins.store.prune_synced(&pins.remote, &pins.local).await {
                Ok(n) => report.pruned = n,
                Err(e) => warn!(error = %e, "Local pin pruning failed"),
            }
        }

        if let Some(cache) = &self.cache {
            match cache.prune().await {
                Ok(n) => report.cache_removed = n,
                Err(e) => warn!(error = %e, "Encode cache pruning failed"),
            }
        }

        match self.remove_stale_job_dirs().await {
            Ok(n) => report.job_dirs_removed = n,
            Err(e) => warn!(error = %e, dir = %self.jobs_dir.display(), "Job directory sweep failed"),
        }

        if report != CleanupReport::default() {
            info!(
                synced = report.synced,
                pruned = report.pruned,
                cache_removed = report.cache_removed,
                job_dirs_removed = report.job_dirs_removed,
                "Cleanup pass"
            );
        }
        report
    }

    async fn remove_stale_job_dirs(&self) -> WorkerResult<usize> {
        let mut dir = match tokio::fs::read_dir(&self.jobs_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_dir() {
                continue;
            }
            let age = metadata
                .modified()?
                .elapsed()
                .unwrap_or_default();
            if age >= self.stale_after {
                tokio::fs::remove_dir_all(entry.path()).await?;
                debug!(dir = %entry.path().display(), age_secs = age.as_secs(), "Removed stale job directory");
                removed += 1;
            }
        }
        Ok(removed)
    }
}
