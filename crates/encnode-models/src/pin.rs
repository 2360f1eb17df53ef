//! Pin records: persistence state of one content address.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ModelError, ModelResult};
use crate::job::JobId;

/// Content identifier returned by a storage node on upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentAddress(String);

impl ContentAddress {
    /// Validate and wrap a content address.
    pub fn parse(s: impl Into<String>) -> ModelResult<Self> {
        let s = s.into();
        let trimmed = s.trim();
        if trimmed.is_empty()
            || trimmed.contains('/')
            || trimmed.chars().any(char::is_whitespace)
        {
            return Err(ModelError::InvalidContentAddress(s));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// URI of the HLS master playlist inside this directory.
    pub fn playlist_uri(&self, playlist: &str) -> String {
        format!("ipfs://{}/{}", self.0, playlist)
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shape of the uploaded artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    File,
    #[default]
    Directory,
}

/// Storage node tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TargetNode {
    #[default]
    Primary,
    Secondary,
    Local,
}

impl TargetNode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetNode::Primary => "primary",
            TargetNode::Secondary => "secondary",
            TargetNode::Local => "local",
        }
    }
}

impl fmt::Display for TargetNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persistence status of a pin record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PinStatus {
    #[default]
    Pending,
    Verified,
    Failed,
    ArchivedLocal,
}

impl PinStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PinStatus::Pending => "pending",
            PinStatus::Verified => "verified",
            PinStatus::Failed => "failed",
            PinStatus::ArchivedLocal => "archived-local",
        }
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self, PinStatus::Pending)
    }
}

/// Tracks persistence of one content address for one job output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinRecord {
    pub hash: ContentAddress,
    pub job_id: JobId,
    pub size_bytes: u64,
    pub kind: ContentKind,
    /// Pin attempts across all nodes; never decreases
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Node that performed the most recent pin
    pub target_node: TargetNode,
    pub status: PinStatus,
    pub created_at: DateTime<Utc>,
}

impl PinRecord {
    pub fn new(hash: ContentAddress, job_id: JobId, size_bytes: u64, kind: ContentKind) -> Self {
        Self {
            hash,
            job_id,
            size_bytes,
            kind,
            attempts: 0,
            last_attempt_at: None,
            target_node: TargetNode::Primary,
            status: PinStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Record one pin attempt against `node`.
    pub fn record_attempt(&mut self, node: TargetNode) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_attempt_at = Some(Utc::now());
        self.target_node = node;
    }

    /// Mark verified. The verifier must have checked the node that pinned.
    pub fn mark_verified(&mut self, verified_on: TargetNode) -> ModelResult<()> {
        self.ensure_pending(PinStatus::Verified)?;
        if verified_on != self.target_node {
            return Err(ModelError::VerifierNodeMismatch {
                pinned: self.target_node,
                verified: verified_on,
            });
        }
        self.status = PinStatus::Verified;
        Ok(())
    }

    pub fn mark_failed(&mut self) -> ModelResult<()> {
        self.ensure_pending(PinStatus::Failed)?;
        self.status = PinStatus::Failed;
        Ok(())
    }

    /// Pinned on the local node after every remote attempt exhausted.
    pub fn mark_archived_local(&mut self) -> ModelResult<()> {
        self.ensure_pending(PinStatus::ArchivedLocal)?;
        if self.target_node != TargetNode::Local {
            return Err(ModelError::VerifierNodeMismatch {
                pinned: self.target_node,
                verified: TargetNode::Local,
            });
        }
        self.status = PinStatus::ArchivedLocal;
        Ok(())
    }

    fn ensure_pending(&self, to: PinStatus) -> ModelResult<()> {
        if self.status.is_settled() {
            return Err(ModelError::InvalidPinTransition {
                from: self.status,
                to,
            });
        }
        Ok(())
    }
}
