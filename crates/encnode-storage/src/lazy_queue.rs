//! Lazy pin queue.
//!
//! Lets a job report complete right after upload while pinning continues in
//! the background. Queued records are snapshotted to disk on every change so a
//! restart resumes them; a semaphore bounds how many pin at once.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, Notify, Semaphore};
use tracing::{error, info, warn};

use encnode_models::PinRecord;

use crate::error::StorageResult;
use crate::metrics::set_lazy_queue_depth;
use crate::tank::TankEngine;

#[derive(Debug, Clone)]
pub struct LazyQueueConfig {
    /// Records pinned concurrently
    pub concurrency: usize,
    /// Background attempts on the primary before falling back
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub snapshot_path: PathBuf,
}

impl LazyQueueConfig {
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            concurrency: 2,
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
            snapshot_path: snapshot_path.into(),
        }
    }

    /// Create config from environment variables, keeping state under `state_dir`.
    pub fn from_env(state_dir: &Path) -> Self {
        let defaults = Self::new(state_dir.join("lazy_pin_queue.json"));
        Self {
            concurrency: std::env::var("LAZY_PIN_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.concurrency),
            max_attempts: std::env::var("LOCAL_FALLBACK_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &u32| *n > 0)
                .unwrap_or(defaults.max_attempts),
            ..defaults
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    records: Vec<PinRecord>,
}

/// In-flight records are keyed by a per-take ticket, since two jobs can
/// produce the same address.
#[derive(Default)]
struct QueueState {
    waiting: VecDeque<PinRecord>,
    in_flight: BTreeMap<u64, PinRecord>,
    next_ticket: u64,
}

impl QueueState {
    fn depth(&self) -> usize {
        self.waiting.len() + self.in_flight.len()
    }
}

pub struct LazyPinQueue {
    config: LazyQueueConfig,
    engine: Arc<TankEngine>,
    state: Mutex<QueueState>,
    notify: Notify,
    semaphore: Arc<Semaphore>,
}

impl LazyPinQueue {
    /// Open the queue, resuming records left in the snapshot.
    pub async fn open(config: LazyQueueConfig, engine: Arc<TankEngine>) -> StorageResult<Arc<Self>> {
        let snapshot: Snapshot = match tokio::fs::read(&config.snapshot_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(e.into()),
        };

        if !snapshot.records.is_empty() {
            info!(count = snapshot.records.len(), "Resuming lazy pin queue");
        }
        set_lazy_queue_depth(snapshot.records.len());

        Ok(Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.concurrency.max(1))),
            config,
            engine,
            state: Mutex::new(QueueState {
                waiting: snapshot.records.into(),
                ..QueueState::default()
            }),
            notify: Notify::new(),
        }))
    }

    pub async fn enqueue(&self, record: PinRecord) -> StorageResult<()> {
        {
            let mut state = self.state.lock().await;
            info!(job_id = %record.job_id, hash = %record.hash, "Queued for background pinning");
            state.waiting.push_back(record);
            self.save(&state).await?;
        }
        self.notify.notify_one();
        Ok(())
    }

    pub async fn depth(&self) -> usize {
        self.state.lock().await.depth()
    }

    /// Consume the queue until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(concurrency = self.config.concurrency, "Lazy pin queue started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            let record = loop {
                if let Some(record) = self.take_next().await {
                    break Some(record);
                }
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = shutdown.changed() => break None,
                }
            };
            let Some(record) = record else { break };

            let queue = Arc::clone(&self);
            tokio::spawn(async move {
                let _permit = permit;
                let (ticket, record) = record;
                queue.run_one(ticket, record).await;
            });
        }

        if let Err(e) = self.flush().await {
            error!(error = %e, "Failed to flush lazy pin queue");
        }
        info!("Lazy pin queue stopped");
    }

    /// Pin one record to a settled state: verified, archived-local or failed.
    pub async fn process(&self, record: PinRecord) -> PinRecord {
        self.settle(None, record).await
    }

    async fn settle(&self, ticket: Option<u64>, mut record: PinRecord) -> PinRecord {
        let primary = self.engine.primary();
        let driver = self.engine.driver();

        for attempt in 0..self.config.max_attempts {
            if driver.attempt(&mut record, primary).await.is_verified() {
                if let Err(e) = record.mark_verified(primary.tier) {
                    warn!(hash = %record.hash, error = %e, "Unexpected pin state");
                }
                return record;
            }
            if let Some(ticket) = ticket {
                self.checkpoint(ticket, &record).await;
            }
            if attempt + 1 < self.config.max_attempts {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }

        if let Some(local) = self.engine.local_fallback() {
            warn!(
                job_id = %record.job_id,
                hash = %record.hash,
                attempts = record.attempts,
                "Background pinning exhausted, falling back to local node"
            );
            if driver.attempt(&mut record, local).await.is_verified() {
                match record.mark_archived_local() {
                    Ok(()) => self.engine.archive_local(&record).await,
                    Err(e) => warn!(hash = %record.hash, error = %e, "Unexpected pin state"),
                }
                return record;
            }
        }

        if let Err(e) = record.mark_failed() {
            warn!(hash = %record.hash, error = %e, "Unexpected pin state");
        }
        error!(
            job_id = %record.job_id,
            hash = %record.hash,
            attempts = record.attempts,
            "Background pinning failed; content stays reachable from the upload node"
        );
        record
    }

    pub async fn flush(&self) -> StorageResult<()> {
        let state = self.state.lock().await;
        self.save(&state).await
    }

    async fn take_next(&self) -> Option<(u64, PinRecord)> {
        let mut state = self.state.lock().await;
        let record = state.waiting.pop_front()?;
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.in_flight.insert(ticket, record.clone());
        Some((ticket, record))
    }

    async fn run_one(&self, ticket: u64, record: PinRecord) {
        let settled = self.settle(Some(ticket), record).await;
        info!(
            job_id = %settled.job_id,
            hash = %settled.hash,
            status = settled.status.as_str(),
            node = %settled.target_node,
            attempts = settled.attempts,
            "Background pin settled"
        );

        let mut state = self.state.lock().await;
        state.in_flight.remove(&ticket);
        if let Err(e) = self.save(&state).await {
            error!(error = %e, "Failed to persist lazy pin queue");
        }
    }

    async fn checkpoint(&self, ticket: u64, record: &PinRecord) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.in_flight.get_mut(&ticket) {
            *entry = record.clone();
            if let Err(e) = self.save(&state).await {
                warn!(error = %e, "Failed to checkpoint lazy pin queue");
            }
        }
    }

    /// Atomic write of waiting and in-flight records. Caller holds the state lock.
    async fn save(&self, state: &QueueState) -> StorageResult<()> {
        let snapshot = Snapshot {
            records: state
                .in_flight
                .values()
                .chain(state.waiting.iter())
                .cloned()
                .collect(),
        };
        let bytes = serde_json::to_vec(&snapshot)?;
        let path = &self.config.snapshot_path;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        set_lazy_queue_depth(state.depth());
        Ok(())
    }
}
