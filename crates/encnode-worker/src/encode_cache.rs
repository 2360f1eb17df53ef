//! Encode memoization cache.
//!
//! Renditions are cached on disk keyed by `(sha256(source), sha256(profile))`
//! so a retried job does not re-encode. Bounded by entry count, evicting the
//! least recently used entry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use encnode_models::EncodingProfile;

use crate::error::WorkerResult;
use crate::metrics::record_cache_lookup;

const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub source_hash: String,
    pub profile_hash: String,
}

impl CacheKey {
    /// The duration limit changes the encoded bytes, so it is part of the profile hash.
    pub fn new(source_ref: &str, profile: &EncodingProfile, max_duration_secs: Option<u32>) -> Self {
        let source_hash = format!("{:x}", Sha256::digest(source_ref.as_bytes()));
        let mut hasher = Sha256::new();
        hasher.update(profile.fingerprint().as_bytes());
        if let Some(limit) = max_duration_secs {
            hasher.update(limit.to_be_bytes());
        }
        Self {
            source_hash,
            profile_hash: format!("{:x}", hasher.finalize()),
        }
    }

    pub fn dir_name(&self) -> String {
        format!("{}-{}", &self.source_hash[..16], &self.profile_hash[..16])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    last_access: DateTime<Utc>,
}

pub struct EncodeCache {
    root: PathBuf,
    max_entries: usize,
    index: Mutex<HashMap<String, CacheEntry>>,
}

impl EncodeCache {
    /// Open the cache, dropping index entries whose directory is gone.
    pub async fn open(root: impl Into<PathBuf>, max_entries: usize) -> WorkerResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let mut index: HashMap<String, CacheEntry> = match tokio::fs::read(root.join(INDEX_FILE)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(error = %e, "Encode cache index unreadable, starting empty");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        index.retain(|name, _| root.join(name).is_dir());

        Ok(Self {
            root,
            max_entries,
            index: Mutex::new(index),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.max_entries > 0
    }

    pub async fn len(&self) -> usize {
        self.index.lock().await.len()
    }

    /// Cached rendition directory, refreshing its last access.
    pub async fn get(&self, key: &CacheKey) -> Option<PathBuf> {
        let name = key.dir_name();
        let mut index = self.index.lock().await;
        let hit = match index.get_mut(&name) {
            Some(entry) if self.root.join(&name).is_dir() => {
                entry.last_access = Utc::now();
                true
            }
            Some(_) => {
                index.remove(&name);
                false
            }
            None => false,
        };
        record_cache_lookup(hit);
        if !hit {
            return None;
        }
        if let Err(e) = self.save(&index).await {
            warn!(error = %e, "Failed to persist encode cache index");
        }
        debug!(entry = %name, "Encode cache hit");
        Some(self.root.join(name))
    }

    /// Move a freshly encoded rendition into the cache and return its new location.
    pub async fn insert(&self, key: &CacheKey, produced: &Path) -> WorkerResult<PathBuf> {
        if !self.is_enabled() {
            return Ok(produced.to_path_buf());
        }
        let name = key.dir_name();
        let dest = self.root.join(&name);
        if dest.exists() {
            tokio::fs::remove_dir_all(&dest).await?;
        }
        if tokio::fs::rename(produced, &dest).await.is_err() {
            copy_dir(produced, &dest).await?;
        }

        let mut index = self.index.lock().await;
        index.insert(
            name,
            CacheEntry {
                last_access: Utc::now(),
            },
        );
        while index.len() > self.max_entries {
            let Some(oldest) = index
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(name, _)| name.clone())
            else {
                break;
            };
            index.remove(&oldest);
            if let Err(e) = tokio::fs::remove_dir_all(self.root.join(&oldest)).await {
                warn!(entry = %oldest, error = %e, "Failed to evict encode cache entry");
            }
            debug!(entry = %oldest, "Evicted encode cache entry");
        }
        self.save(&index).await?;
        Ok(dest)
    }

    /// Drop index entries whose directories vanished and directories the index forgot.
    pub async fn prune(&self) -> WorkerResult<usize> {
        let mut index = self.index.lock().await;
        index.retain(|name, _| self.root.join(name).is_dir());

        let mut removed = 0;
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await?.is_dir() && !index.contains_key(&name) {
                tokio::fs::remove_dir_all(entry.path()).await?;
                removed += 1;
            }
        }
        self.save(&index).await?;
        Ok(removed)
    }

    async fn save(&self, index: &HashMap<String, CacheEntry>) -> WorkerResult<()> {
        let bytes = serde_json::to_vec(index).map_err(std::io::Error::from)?;
        let tmp = self.root.join(format!("{}.tmp", INDEX_FILE));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, self.root.join(INDEX_FILE)).await?;
        Ok(())
    }
}

/// Recursively copy `src` into `dst`.
pub async fn copy_dir(src: &Path, dst: &Path) -> WorkerResult<()> {
    let mut stack = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = stack.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut dir = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = dir.next_entry().await? {
            let target = to.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                stack.push((entry.path(), target));
            } else {
                tokio::fs::copy(entry.path(), target).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn rendition(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        tokio::fs::create_dir_all(&path).await.unwrap();
        tokio::fs::write(path.join("index.m3u8"), b"#EXTM3U\n").await.unwrap();
        path
    }

    #[test]
    fn test_key_depends_on_source_profile_and_limit() {
        let a = CacheKey::new("ipfs://QmA", &EncodingProfile::p720(), None);
        assert_eq!(a, CacheKey::new("ipfs://QmA", &EncodingProfile::p720(), None));
        assert_ne!(a, CacheKey::new("ipfs://QmB", &EncodingProfile::p720(), None));
        assert_ne!(a, CacheKey::new("ipfs://QmA", &EncodingProfile::p480(), None));
        assert_ne!(a, CacheKey::new("ipfs://QmA", &EncodingProfile::p720(), Some(60)));
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let scratch = tempfile::tempdir().unwrap();
        let cache = EncodeCache::open(scratch.path().join("cache"), 2).await.unwrap();
        let key = |s: &str| CacheKey::new(s, &EncodingProfile::p480(), None);

        cache.insert(&key("a"), &rendition(scratch.path(), "a").await).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        cache.insert(&key("b"), &rendition(scratch.path(), "b").await).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(cache.get(&key("a")).await.is_some());
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        cache.insert(&key("c"), &rendition(scratch.path(), "c").await).await.unwrap();

        assert_eq!(cache.len().await, 2);
        assert!(cache.get(&key("a")).await.is_some());
        assert!(cache.get(&key("b")).await.is_none());
        assert!(cache.get(&key("c")).await.is_some());
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let scratch = tempfile::tempdir().unwrap();
        let root = scratch.path().join("cache");
        let key = CacheKey::new("src", &EncodingProfile::p480(), None);
        {
            let cache = EncodeCache::open(&root, 4).await.unwrap();
            let stored = cache.insert(&key, &rendition(scratch.path(), "r").await).await.unwrap();
            assert!(stored.join("index.m3u8").exists());
        }

        let reopened = EncodeCache::open(&root, 4).await.unwrap();
        assert!(reopened.get(&key).await.is_some());
    }
}
