//! Storage node seam and the Kubo HTTP API client.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use serde::Deserialize;
use tracing::debug;

use encnode_models::{ContentAddress, ContentKind, TargetNode};

use crate::error::{StorageError, StorageResult};
use crate::metrics::record_upload;

/// What a node returned for an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub content_address: ContentAddress,
    pub size_bytes: u64,
    pub kind: ContentKind,
}

/// Operations offered by a content-addressed storage node.
#[async_trait]
pub trait StorageNode: Send + Sync {
    /// Add a file or directory tree without pinning it.
    async fn upload(&self, path: &Path) -> StorageResult<UploadReceipt>;

    /// Pin by address. The node fetches the content from the network if needed.
    async fn pin(&self, hash: &ContentAddress) -> StorageResult<()>;

    async fn unpin(&self, hash: &ContentAddress) -> StorageResult<()>;

    /// True when the address is recursively pinned and its root block is held locally.
    async fn verify_pinned(&self, hash: &ContentAddress) -> StorageResult<bool>;

    /// Advertise the address to the network.
    async fn announce(&self, hash: &ContentAddress) -> StorageResult<()>;

    /// Where the node's API lives. Two tiers with the same root are one daemon.
    fn api_root(&self) -> &str;
}

/// A node together with the tier it serves in.
#[derive(Clone)]
pub struct TieredNode {
    pub tier: TargetNode,
    pub name: String,
    pub node: Arc<dyn StorageNode>,
}

impl TieredNode {
    pub fn new(tier: TargetNode, name: impl Into<String>, node: Arc<dyn StorageNode>) -> Self {
        Self {
            tier,
            name: name.into(),
            node,
        }
    }
}

impl TieredNode {
    /// Whether both tiers talk to the same daemon.
    pub fn shares_daemon_with(&self, other: &TieredNode) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
            || same_api_root(self.node.api_root(), other.node.api_root())
    }
}

/// Compare API roots ignoring case, trailing slashes and `localhost` vs loopback.
pub fn same_api_root(a: &str, b: &str) -> bool {
    fn normalize(url: &str) -> String {
        url.trim()
            .trim_end_matches('/')
            .to_ascii_lowercase()
            .replace("://localhost", "://127.0.0.1")
    }
    normalize(a) == normalize(b)
}

impl std::fmt::Debug for TieredNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredNode")
            .field("tier", &self.tier)
            .field("name", &self.name)
            .finish()
    }
}

/// Kubo API client configuration.
#[derive(Debug, Clone)]
pub struct KuboNodeConfig {
    /// API root, e.g. `http://127.0.0.1:5001`
    pub api_url: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl KuboNodeConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Deserialize)]
struct AddEntry {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Hash")]
    hash: String,
}

#[derive(Debug, Deserialize)]
struct PinLsResponse {
    #[serde(rename = "Keys", default)]
    keys: std::collections::HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "Message", default)]
    message: String,
}

enum UploadEntry {
    Dir(String),
    File { rel: String, path: PathBuf, len: u64 },
}

/// Storage node reached through the Kubo RPC API (`/api/v0`).
#[derive(Clone)]
pub struct KuboNode {
    http: Client,
    config: KuboNodeConfig,
}

impl KuboNode {
    pub fn new(config: KuboNodeConfig) -> StorageResult<Self> {
        if config.api_url.is_empty() {
            return Err(StorageError::config_error("empty node API URL"));
        }
        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .user_agent(concat!("encnode-storage/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(StorageError::Network)?;
        Ok(Self { http, config })
    }

    pub fn api_url(&self) -> &str {
        &self.config.api_url
    }

    /// Node daemon version; a cheap reachability probe.
    pub async fn version(&self) -> StorageResult<String> {
        #[derive(Deserialize)]
        struct Version {
            #[serde(rename = "Version")]
            version: String,
        }
        let response = self.call("version", &[]).await?;
        let parsed: Version = response
            .json()
            .await
            .map_err(|e| StorageError::invalid_response(format!("version: {}", e)))?;
        Ok(parsed.version)
    }

    fn endpoint(&self, command: &str) -> String {
        format!("{}/api/v0/{}", self.config.api_url, command)
    }

    async fn send(&self, request: reqwest::RequestBuilder, command: &str) -> StorageResult<reqwest::Response> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                StorageError::Timeout(format!("{} on {}", command, self.config.api_url))
            } else {
                StorageError::Network(e)
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiError>(&body)
            .map(|e| e.message)
            .unwrap_or(body);
        Err(StorageError::from_http_status(status.as_u16(), message))
    }

    async fn call(&self, command: &str, args: &[(&str, &str)]) -> StorageResult<reqwest::Response> {
        let request = self.http.post(self.endpoint(command)).query(args);
        self.send(request, command).await
    }

    /// Pre-order walk so every directory part precedes its children.
    async fn collect_entries(root: &Path, root_name: &str) -> StorageResult<(Vec<UploadEntry>, u64)> {
        let mut entries = Vec::new();
        let mut total = 0u64;
        let mut stack = vec![(root.to_path_buf(), root_name.to_string())];

        while let Some((path, rel)) = stack.pop() {
            let metadata = tokio::fs::metadata(&path).await?;
            if metadata.is_dir() {
                entries.push(UploadEntry::Dir(rel.clone()));
                let mut children = Vec::new();
                let mut dir = tokio::fs::read_dir(&path).await?;
                while let Some(child) = dir.next_entry().await? {
                    let name = child.file_name().to_string_lossy().into_owned();
                    children.push((child.path(), format!("{}/{}", rel, name)));
                }
                children.sort_by(|a, b| b.1.cmp(&a.1));
                stack.extend(children);
            } else {
                total += metadata.len();
                entries.push(UploadEntry::File {
                    rel,
                    path,
                    len: metadata.len(),
                });
            }
        }
        Ok((entries, total))
    }
}

#[async_trait]
impl StorageNode for KuboNode {
    async fn upload(&self, path: &Path) -> StorageResult<UploadReceipt> {
        let started = Instant::now();
        let root_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| StorageError::upload_failed(format!("no file name in {}", path.display())))?;

        let metadata = tokio::fs::metadata(path).await?;
        let kind = if metadata.is_dir() {
            ContentKind::Directory
        } else {
            ContentKind::File
        };

        let (entries, size_bytes) = Self::collect_entries(path, &root_name).await?;
        let mut form = Form::new();
        for entry in entries {
            let part = match entry {
                UploadEntry::Dir(rel) => Part::bytes(Vec::new())
                    .file_name(urlencoding::encode(&rel).into_owned())
                    .mime_str("application/x-directory")?,
                UploadEntry::File { rel, path, len } => {
                    let file = tokio::fs::File::open(&path).await?;
                    Part::stream_with_length(Body::from(file), len)
                        .file_name(urlencoding::encode(&rel).into_owned())
                        .mime_str("application/octet-stream")?
                }
            };
            form = form.part("file", part);
        }

        let request = self
            .http
            .post(self.endpoint("add"))
            .query(&[("pin", "false"), ("cid-version", "1"), ("quieter", "false")])
            .multipart(form);
        let body = self
            .send(request, "add")
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?
            .text()
            .await?;

        let mut root_hash = None;
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            let entry: AddEntry = serde_json::from_str(line)
                .map_err(|e| StorageError::invalid_response(format!("add entry: {}", e)))?;
            if entry.name == root_name {
                root_hash = Some(entry.hash);
            }
        }
        let hash = root_hash
            .ok_or_else(|| StorageError::invalid_response(format!("no root entry for {}", root_name)))?;

        record_upload(started.elapsed().as_secs_f64());
        debug!(hash = %hash, size_bytes, node = %self.config.api_url, "Uploaded artifact");

        Ok(UploadReceipt {
            content_address: ContentAddress::parse(hash)?,
            size_bytes,
            kind,
        })
    }

    async fn pin(&self, hash: &ContentAddress) -> StorageResult<()> {
        self.call("pin/add", &[("arg", hash.as_str()), ("recursive", "true")])
            .await?;
        Ok(())
    }

    async fn unpin(&self, hash: &ContentAddress) -> StorageResult<()> {
        match self
            .call("pin/rm", &[("arg", hash.as_str()), ("recursive", "true")])
            .await
        {
            Ok(_) => Ok(()),
            Err(StorageError::ServerError(_, msg)) if msg.contains("not pinned") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn verify_pinned(&self, hash: &ContentAddress) -> StorageResult<bool> {
        let response = match self
            .call("pin/ls", &[("arg", hash.as_str()), ("type", "recursive")])
            .await
        {
            Ok(response) => response,
            Err(StorageError::ServerError(_, msg)) if msg.contains("not pinned") => return Ok(false),
            Err(e) => return Err(e),
        };
        let listed: PinLsResponse = response
            .json()
            .await
            .map_err(|e| StorageError::invalid_response(format!("pin/ls: {}", e)))?;
        if listed.keys.is_empty() {
            return Ok(false);
        }

        // Pinned is not enough: the root block must be served without a network fetch.
        match self
            .call("block/stat", &[("arg", hash.as_str()), ("offline", "true")])
            .await
        {
            Ok(_) => Ok(true),
            Err(StorageError::ServerError(_, _)) | Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn announce(&self, hash: &ContentAddress) -> StorageResult<()> {
        self.call("routing/provide", &[("arg", hash.as_str())]).await?;
        Ok(())
    }

    fn api_root(&self) -> &str {
        &self.config.api_url
    }
}
