//! Append-only local-fallback ledger.
//!
//! One JSON object per line. Each entry names content that only the worker's
//! local node holds, and is the handoff to out-of-band batch migration.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use encnode_models::{ContentAddress, ContentKind, JobId, PinRecord};

use crate::error::StorageResult;
use crate::metrics::record_ledger_append;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub hash: ContentAddress,
    pub job_id: JobId,
    pub size_bytes: u64,
    /// Pin attempts made before falling back
    pub failure_count: u32,
    pub kind: ContentKind,
    pub archived_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn from_record(record: &PinRecord) -> Self {
        Self {
            hash: record.hash.clone(),
            job_id: record.job_id.clone(),
            size_bytes: record.size_bytes,
            failure_count: record.attempts.saturating_sub(1),
            kind: record.kind,
            archived_at: Utc::now(),
        }
    }
}

pub struct FallbackLedger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FallbackLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry as a single write.
    pub async fn append(&self, entry: &LedgerEntry) -> StorageResult<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        record_ledger_append();
        info!(
            hash = %entry.hash,
            job_id = %entry.job_id,
            size_bytes = entry.size_bytes,
            failure_count = entry.failure_count,
            "Archived to local-fallback ledger"
        );
        Ok(())
    }

    /// Read every entry. Unparseable lines are skipped.
    pub async fn entries(&self) -> StorageResult<Vec<LedgerEntry>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(line = n + 1, error = %e, "Skipping corrupt ledger line"),
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entry(hash: &str) -> LedgerEntry {
        LedgerEntry {
            hash: ContentAddress::parse(hash).unwrap(),
            job_id: JobId::from_string("J1"),
            size_bytes: 2048,
            failure_count: 3,
            kind: ContentKind::Directory,
            archived_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_missing_ledger_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FallbackLedger::new(dir.path().join("ledger.jsonl"));
        assert!(ledger.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_appends_keep_whole_lines() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(FallbackLedger::new(dir.path().join("state/ledger.jsonl")));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.append(&entry(&format!("Qm{}", i))).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let entries = ledger.entries().await.unwrap();
        assert_eq!(entries.len(), 16);
        assert!(entries.iter().all(|e| e.failure_count == 3));
    }

    #[tokio::test]
    async fn test_corrupt_line_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let ledger = FallbackLedger::new(&path);
        ledger.append(&entry("QmA")).await.unwrap();
        tokio::fs::write(
            &path,
            format!("{}{{truncated\n", tokio::fs::read_to_string(&path).await.unwrap()),
        )
        .await
        .unwrap();

        assert_eq!(ledger.entries().await.unwrap().len(), 1);
    }
}
