//! Scriptable in-memory storage node for tests.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use encnode_models::{ContentAddress, ContentKind};

use crate::error::{StorageError, StorageResult};
use crate::node::{StorageNode, UploadReceipt};

#[derive(Default)]
struct FakeState {
    upload_cid: Option<String>,
    upload_error: bool,
    pin_error: bool,
    verify_error: bool,
    verify_default: Option<bool>,
    verify_script: VecDeque<bool>,
    pinned: HashSet<ContentAddress>,
    uploads: u32,
    pins: u32,
    unpins: u32,
    verifies: u32,
    announces: u32,
}

/// In-memory node. Verification reflects the pin set unless scripted.
pub struct FakeNode {
    name: String,
    api_root: String,
    state: Mutex<FakeState>,
}

impl FakeNode {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            api_root: format!("fake://{}", name),
            name,
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Pretend to be reachable at `api_root`.
    pub fn with_api_root(mut self, api_root: impl Into<String>) -> Self {
        self.api_root = api_root.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn set_upload_cid(&self, cid: &str) {
        self.with_state(|s| s.upload_cid = Some(cid.to_string()));
    }

    pub fn set_upload_error(&self, fail: bool) {
        self.with_state(|s| s.upload_error = fail);
    }

    pub fn set_pin_error(&self, fail: bool) {
        self.with_state(|s| s.pin_error = fail);
    }

    /// Make `verify_pinned` return an error.
    pub fn fail_verification_calls(&self, fail: bool) {
        self.with_state(|s| s.verify_error = fail);
    }

    /// Fixed verification answer once the script is consumed.
    pub fn set_verify_default(&self, verified: bool) {
        self.with_state(|s| s.verify_default = Some(verified));
    }

    /// Answers consumed in order by successive verification calls.
    pub fn script_verifications(&self, answers: impl IntoIterator<Item = bool>) {
        self.with_state(|s| s.verify_script.extend(answers));
    }

    pub fn upload_calls(&self) -> u32 {
        self.with_state(|s| s.uploads)
    }

    pub fn pin_calls(&self) -> u32 {
        self.with_state(|s| s.pins)
    }

    pub fn unpin_calls(&self) -> u32 {
        self.with_state(|s| s.unpins)
    }

    pub fn verify_calls(&self) -> u32 {
        self.with_state(|s| s.verifies)
    }

    pub fn announce_calls(&self) -> u32 {
        self.with_state(|s| s.announces)
    }

    pub fn is_pinned(&self, hash: &ContentAddress) -> bool {
        self.with_state(|s| s.pinned.contains(hash))
    }
}

#[async_trait]
impl StorageNode for FakeNode {
    async fn upload(&self, path: &Path) -> StorageResult<UploadReceipt> {
        let (fail, cid) = self.with_state(|s| {
            s.uploads += 1;
            (s.upload_error, s.upload_cid.clone())
        });
        if fail {
            return Err(StorageError::upload_failed(format!("{} rejected upload", self.name)));
        }
        let kind = if path.is_dir() {
            ContentKind::Directory
        } else {
            ContentKind::File
        };
        Ok(UploadReceipt {
            content_address: ContentAddress::parse(cid.unwrap_or_else(|| "QmFake".to_string()))?,
            size_bytes: 1024,
            kind,
        })
    }

    async fn pin(&self, hash: &ContentAddress) -> StorageResult<()> {
        self.with_state(|s| {
            s.pins += 1;
            if s.pin_error {
                return Err(StorageError::ServerError(503, "pin unavailable".to_string()));
            }
            s.pinned.insert(hash.clone());
            Ok(())
        })
    }

    async fn unpin(&self, hash: &ContentAddress) -> StorageResult<()> {
        self.with_state(|s| {
            s.unpins += 1;
            s.pinned.remove(hash);
        });
        Ok(())
    }

    async fn verify_pinned(&self, hash: &ContentAddress) -> StorageResult<bool> {
        self.with_state(|s| {
            s.verifies += 1;
            if s.verify_error {
                return Err(StorageError::Timeout("verify".to_string()));
            }
            if let Some(answer) = s.verify_script.pop_front() {
                return Ok(answer);
            }
            Ok(s.verify_default.unwrap_or_else(|| s.pinned.contains(hash)))
        })
    }

    async fn announce(&self, _hash: &ContentAddress) -> StorageResult<()> {
        self.with_state(|s| s.announces += 1);
        Ok(())
    }

    fn api_root(&self) -> &str {
        &self.api_root
    }
}
