//! Local pin tracking.
//!
//! Content pinned on the worker's own node is tracked by address with a sync
//! status. Once the primary network holds a copy the entry is `synced`, and the
//! cleanup pass unpins it locally.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use encnode_models::{ContentAddress, JobId};

use crate::error::{StorageError, StorageResult};
use crate::node::TieredNode;
use crate::verifier::PersistenceVerifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalPin {
    pub job_id: JobId,
    pub size_bytes: u64,
    pub status: SyncStatus,
    pub pinned_at: DateTime<Utc>,
}

/// Persisted map of content address to local pin state.
pub struct LocalPinStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<ContentAddress, LocalPin>>,
}

impl LocalPinStore {
    /// Load the store from `path`; a missing file is an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn track(&self, hash: &ContentAddress, job_id: &JobId, size_bytes: u64) -> StorageResult<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            hash.clone(),
            LocalPin {
                job_id: job_id.clone(),
                size_bytes,
                status: SyncStatus::Pending,
                pinned_at: Utc::now(),
            },
        );
        self.save(&entries).await
    }

    /// Returns false when the address is not tracked.
    pub async fn set_status(&self, hash: &ContentAddress, status: SyncStatus) -> StorageResult<bool> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(hash) else {
            return Ok(false);
        };
        entry.status = status;
        self.save(&entries).await?;
        Ok(true)
    }

    pub async fn get(&self, hash: &ContentAddress) -> Option<LocalPin> {
        self.entries.lock().await.get(hash).cloned()
    }

    pub async fn entries(&self) -> Vec<(ContentAddress, LocalPin)> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Mark pending entries synced once `remote` verifies them. Returns the count marked.
    ///
    /// Refuses to run when `remote` and `local` are the same daemon: a local pin
    /// would verify as remote and later be unpinned as redundant.
    pub async fn reconcile(
        &self,
        verifier: &PersistenceVerifier,
        remote: &TieredNode,
        local: &TieredNode,
    ) -> StorageResult<usize> {
        ensure_distinct(remote, local)?;
        let pending: Vec<ContentAddress> = self
            .entries
            .lock()
            .await
            .iter()
            .filter(|(_, pin)| pin.status == SyncStatus::Pending)
            .map(|(hash, _)| hash.clone())
            .collect();

        let mut synced = 0;
        for hash in pending {
            if verifier.verify(remote, &hash).await {
                self.set_status(&hash, SyncStatus::Synced).await?;
                synced += 1;
                debug!(hash = %hash, node = %remote.name, "Local pin now held remotely");
            }
        }
        Ok(synced)
    }

    /// Unpin synced entries from the local node and drop them. Returns the count removed.
    pub async fn prune_synced(&self, remote: &TieredNode, local: &TieredNode) -> StorageResult<usize> {
        ensure_distinct(remote, local)?;
        let synced: Vec<ContentAddress> = self
            .entries
            .lock()
            .await
            .iter()
            .filter(|(_, pin)| pin.status == SyncStatus::Synced)
            .map(|(hash, _)| hash.clone())
            .collect();

        let mut removed = Vec::new();
        for hash in synced {
            match local.node.unpin(&hash).await {
                Ok(()) => removed.push(hash),
                Err(e) => warn!(hash = %hash, error = %e, "Failed to unpin synced content"),
            }
        }

        if !removed.is_empty() {
            let mut entries = self.entries.lock().await;
            for hash in &removed {
                entries.remove(hash);
            }
            self.save(&entries).await?;
            info!(count = removed.len(), "Pruned synced local pins");
        }
        Ok(removed.len())
    }

    /// Atomic write: temp file then rename.
    async fn save(&self, entries: &BTreeMap<ContentAddress, LocalPin>) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn ensure_distinct(remote: &TieredNode, local: &TieredNode) -> StorageResult<()> {
    if remote.shares_daemon_with(local) {
        return Err(StorageError::config_error(format!(
            "{} and {} share the daemon at {}",
            remote.name,
            local.name,
            local.node.api_root()
        )));
    }
    Ok(())
}
