//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use encnode_storage::{same_api_root, TankConfig};

/// Rescue loop settings.
#[derive(Debug, Clone)]
pub struct RescueConfig {
    pub enabled: bool,
    /// Time between rescue scans
    pub interval: Duration,
    /// Minimum age of a `queued` job before it counts as abandoned
    pub abandoned_threshold: Duration,
    /// Claims per scan
    pub max_per_cycle: usize,
}

impl Default for RescueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            abandoned_threshold: Duration::from_secs(300), // 5 minutes
            max_per_cycle: 2,
        }
    }
}

impl RescueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            enabled: std::env::var("RESCUE_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            interval: Duration::from_secs(
                std::env::var("RESCUE_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
            abandoned_threshold: Duration::from_secs(
                std::env::var("RESCUE_ABANDONED_THRESHOLD_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
            max_per_cycle: std::env::var("RESCUE_MAX_PER_CYCLE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2),
        }
    }
}

/// Storage node API endpoints.
#[derive(Debug, Clone)]
pub struct NodeEndpoints {
    pub primary_url: String,
    pub secondary_urls: Vec<String>,
    pub local_url: String,
    pub request_timeout: Duration,
}

impl Default for NodeEndpoints {
    fn default() -> Self {
        Self {
            primary_url: "http://127.0.0.1:5001".to_string(),
            secondary_urls: Vec::new(),
            local_url: "http://127.0.0.1:5001".to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl NodeEndpoints {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            primary_url: std::env::var("IPFS_PRIMARY_URL").unwrap_or(defaults.primary_url),
            secondary_urls: std::env::var("IPFS_SECONDARY_URLS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            local_url: std::env::var("IPFS_LOCAL_URL").unwrap_or(defaults.local_url),
            request_timeout: Duration::from_secs(
                std::env::var("NODE_REQUEST_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
        }
    }

    /// The local endpoint is also a remote tier, so local pins are the remote copy.
    pub fn local_shares_remote(&self) -> bool {
        same_api_root(&self.local_url, &self.primary_url)
            || self
                .secondary_urls
                .iter()
                .any(|url| same_api_root(&self.local_url, url))
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity written into claims
    pub worker_id: String,
    /// Maximum concurrent jobs
    pub max_concurrent_jobs: usize,
    /// Scratch space and persisted worker state
    pub work_dir: PathBuf,
    /// Gateway polling interval
    pub poll_interval: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Store-level attempts for direct-path jobs before they are marked failed
    pub job_max_attempts: u32,
    /// Complete after upload and pin in the background
    pub lazy_pinning: bool,
    /// Encode cache bound (entries)
    pub encode_cache_max_entries: usize,
    /// Per-encode timeout
    pub encode_timeout: Duration,
    /// Encoder binary
    pub encoder_command: String,
    /// HTTP gateway used to read `ipfs://` sources
    pub ipfs_gateway_url: String,
    pub cleanup_interval: Duration,
    /// Prometheus exporter port
    pub metrics_port: Option<u16>,
    pub rescue: RescueConfig,
    pub tank: TankConfig,
    pub nodes: NodeEndpoints,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("encoder-{}", uuid::Uuid::new_v4()),
            max_concurrent_jobs: 1,
            work_dir: PathBuf::from("/tmp/encnode"),
            poll_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(60),
            job_max_attempts: 3,
            lazy_pinning: false,
            encode_cache_max_entries: 32,
            encode_timeout: Duration::from_secs(3600), // 1 hour
            encoder_command: "ffmpeg".to_string(),
            ipfs_gateway_url: "http://127.0.0.1:8080".to_string(),
            cleanup_interval: Duration::from_secs(3600),
            metrics_port: None,
            rescue: RescueConfig::default(),
            tank: TankConfig::default(),
            nodes: NodeEndpoints::default(),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_id: std::env::var("WORKER_ID")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.worker_id),
            max_concurrent_jobs: std::env::var("WORKER_MAX_JOBS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(1),
            work_dir: std::env::var("WORKER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            poll_interval: Duration::from_secs(
                std::env::var("GATEWAY_POLL_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
            shutdown_timeout: Duration::from_secs(
                std::env::var("WORKER_SHUTDOWN_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
            job_max_attempts: std::env::var("JOB_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            lazy_pinning: std::env::var("LAZY_PINNING_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            encode_cache_max_entries: std::env::var("ENCODE_CACHE_MAX_ENTRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(32),
            encode_timeout: Duration::from_secs(
                std::env::var("ENCODE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3600),
            ),
            encoder_command: std::env::var("ENCODER_COMMAND").unwrap_or(defaults.encoder_command),
            ipfs_gateway_url: std::env::var("IPFS_GATEWAY_URL").unwrap_or(defaults.ipfs_gateway_url),
            cleanup_interval: Duration::from_secs(
                std::env::var("CLEANUP_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3600),
            ),
            metrics_port: std::env::var("METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
            rescue: RescueConfig::from_env(),
            tank: TankConfig::from_env(),
            nodes: NodeEndpoints::from_env(),
        }
    }

    /// Persisted worker state (queue snapshot, ledger, local pins).
    pub fn state_dir(&self) -> PathBuf {
        self.work_dir.join("state")
    }

    /// Per-job scratch directories.
    pub fn jobs_dir(&self) -> PathBuf {
        self.work_dir.join("jobs")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.work_dir.join("encode-cache")
    }

    /// Append-only record of content archived on the local node.
    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir().join("fallback_ledger.jsonl")
    }

    pub fn local_pins_path(&self) -> PathBuf {
        self.state_dir().join("local_pins.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert!(config.worker_id.starts_with("encoder-"));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.rescue.interval, Duration::from_secs(60));
        assert_eq!(config.rescue.abandoned_threshold, Duration::from_secs(300));
        assert_eq!(config.rescue.max_per_cycle, 2);
        assert!(!config.tank.local_fallback_enabled);
        assert_eq!(config.state_dir(), PathBuf::from("/tmp/encnode/state"));
    }

    #[test]
    fn test_default_endpoints_share_one_daemon() {
        let mut nodes = NodeEndpoints::default();
        assert!(nodes.local_shares_remote());

        nodes.local_url = "http://127.0.0.1:5002".to_string();
        assert!(!nodes.local_shares_remote());

        nodes.secondary_urls = vec!["http://localhost:5002/".to_string()];
        assert!(nodes.local_shares_remote());
    }
}
