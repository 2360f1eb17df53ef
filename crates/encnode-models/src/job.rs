//! Job definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{ModelError, ModelResult};
use crate::job_status::JobStatus;
use crate::pin::ContentAddress;
use crate::profile::EncodingProfile;

/// Hard duration cap applied to short-form gateway jobs.
pub const SHORT_VIDEO_MAX_SECS: u32 = 60;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID (direct-API jobs).
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// How this worker came to hold the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AcquisitionPath {
    /// Handed out and accepted through the gateway
    #[default]
    Gateway,
    /// Gateway accept failed, but the store shows the job assigned to us
    MongoVerified,
    /// Gateway accept failed and the job was claimed directly in the store
    DefensiveTakeover,
    /// Claimed by the rescue scan after being abandoned in `queued`
    Rescued,
}

impl AcquisitionPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcquisitionPath::Gateway => "gateway",
            AcquisitionPath::MongoVerified => "mongo-verified",
            AcquisitionPath::DefensiveTakeover => "defensive-takeover",
            AcquisitionPath::Rescued => "rescued",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gateway" => Some(AcquisitionPath::Gateway),
            "mongo-verified" => Some(AcquisitionPath::MongoVerified),
            "defensive-takeover" => Some(AcquisitionPath::DefensiveTakeover),
            "rescued" => Some(AcquisitionPath::Rescued),
            _ => None,
        }
    }

    /// Every path except the gateway reports straight to the store.
    pub fn bypasses_gateway(&self) -> bool {
        !matches!(self, AcquisitionPath::Gateway)
    }
}

impl fmt::Display for AcquisitionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a job came from. Each variant carries only the fields that exist
/// for that origin; profile selection and duration limits branch on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum JobSource {
    /// Published by the gateway for a social post
    Gateway {
        owner: String,
        permlink: String,
        /// Short-form video: single low rendition with a hard duration cap
        #[serde(default)]
        short: bool,
    },
    /// Submitted by an API client without the gateway
    Direct {
        owner: String,
        api_client: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_duration_secs: Option<u32>,
    },
}

impl JobSource {
    /// Account used for attribution.
    pub fn owner(&self) -> &str {
        match self {
            JobSource::Gateway { owner, .. } | JobSource::Direct { owner, .. } => owner,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobSource::Gateway { .. } => "gateway",
            JobSource::Direct { .. } => "direct",
        }
    }

    /// Pick the renditions to encode.
    ///
    /// Gateway jobs fall back to the default ladder and short videos collapse to
    /// the lowest rendition. Direct jobs must name their profiles.
    pub fn select_profiles(&self, requested: &[EncodingProfile]) -> ModelResult<Vec<EncodingProfile>> {
        match self {
            JobSource::Gateway { short: true, .. } => {
                let lowest = requested
                    .iter()
                    .min_by_key(|p| p.height)
                    .cloned()
                    .unwrap_or_else(EncodingProfile::p480);
                Ok(vec![lowest])
            }
            JobSource::Gateway { short: false, .. } => {
                if requested.is_empty() {
                    Ok(EncodingProfile::default_ladder())
                } else {
                    Ok(requested.to_vec())
                }
            }
            JobSource::Direct { api_client, .. } => {
                if requested.is_empty() {
                    return Err(ModelError::invalid_job(format!(
                        "direct job from {} has no profiles",
                        api_client
                    )));
                }
                Ok(requested.to_vec())
            }
        }
    }

    /// Maximum encoded duration in seconds, if any.
    pub fn duration_limit_secs(&self) -> Option<u32> {
        match self {
            JobSource::Gateway { short: true, .. } => Some(SHORT_VIDEO_MAX_SECS),
            JobSource::Gateway { short: false, .. } => None,
            JobSource::Direct {
                max_duration_secs, ..
            } => *max_duration_secs,
        }
    }
}

/// Job as published by the gateway or stored in the authoritative store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescription {
    pub id: JobId,
    /// URI or content address of the source video
    pub input_ref: String,
    #[serde(default)]
    pub profiles: Vec<EncodingProfile>,
    pub source: JobSource,
    pub created_at: DateTime<Utc>,
}

impl JobDescription {
    pub fn new(id: JobId, input_ref: impl Into<String>, source: JobSource) -> Self {
        Self {
            id,
            input_ref: input_ref.into(),
            profiles: Vec::new(),
            source,
            created_at: Utc::now(),
        }
    }

    pub fn with_profiles(mut self, profiles: Vec<EncodingProfile>) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// Verified output of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub content_address: ContentAddress,
    pub playlist_uri: String,
    #[serde(default)]
    pub size_bytes: u64,
}

impl JobResult {
    /// Master playlist name inside the uploaded directory.
    pub const MASTER_PLAYLIST: &'static str = "manifest.m3u8";

    pub fn new(content_address: ContentAddress, size_bytes: u64) -> Self {
        let playlist_uri = content_address.playlist_uri(Self::MASTER_PLAYLIST);
        Self {
            content_address,
            playlist_uri,
            size_bytes,
        }
    }
}

/// A job held by this worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub input_ref: String,
    pub profiles: Vec<EncodingProfile>,
    pub source: JobSource,
    pub acquisition_path: AcquisitionPath,
    /// Completion for this job bypasses the gateway. Never cleared once set.
    #[serde(default)]
    pub defensive_takeover: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_worker: Option<String>,
}

impl Job {
    /// Build the local view of a job this worker just acquired.
    pub fn claimed(
        description: JobDescription,
        path: AcquisitionPath,
        worker_id: impl Into<String>,
    ) -> Self {
        // Store-side claims write `running` atomically; gateway hand-outs start at `assigned`.
        let status = match path {
            AcquisitionPath::Gateway | AcquisitionPath::MongoVerified => JobStatus::Assigned,
            AcquisitionPath::DefensiveTakeover | AcquisitionPath::Rescued => JobStatus::Running,
        };
        Self {
            id: description.id,
            status,
            created_at: description.created_at,
            updated_at: Utc::now(),
            input_ref: description.input_ref,
            profiles: description.profiles,
            source: description.source,
            acquisition_path: path,
            defensive_takeover: path.bypasses_gateway(),
            result: None,
            attempt_count: 0,
            last_error: None,
            assigned_worker: Some(worker_id.into()),
        }
    }

    /// Move to `next`, enforcing the forward-only lifecycle.
    pub fn transition(&mut self, next: JobStatus) -> ModelResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ModelError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Route every future report for this job around the gateway.
    pub fn mark_defensive_takeover(&mut self) {
        self.defensive_takeover = true;
    }

    /// True when completion must go straight to the store.
    pub fn bypasses_gateway(&self) -> bool {
        self.defensive_takeover || self.acquisition_path.bypasses_gateway()
    }

    pub fn complete(&mut self, result: JobResult) -> ModelResult<()> {
        self.transition(JobStatus::Complete)?;
        self.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> ModelResult<()> {
        self.transition(JobStatus::Failed)?;
        self.last_error = Some(error.into());
        self.attempt_count = self.attempt_count.saturating_add(1);
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Age relative to `now`, clamped at zero.
    pub fn age_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.created_at).max(chrono::Duration::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway_description(short: bool) -> JobDescription {
        JobDescription::new(
            JobId::from_string("J1"),
            "ipfs://QmSource",
            JobSource::Gateway {
                owner: "alice".into(),
                permlink: "my-video".into(),
                short,
            },
        )
    }

    #[test]
    fn test_claimed_status_follows_path() {
        let job = Job::claimed(gateway_description(false), AcquisitionPath::Gateway, "w1");
        assert_eq!(job.status, JobStatus::Assigned);
        assert!(!job.bypasses_gateway());

        let job = Job::claimed(gateway_description(false), AcquisitionPath::Rescued, "w1");
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.defensive_takeover);
    }

    #[test]
    fn test_mongo_verified_bypasses_gateway() {
        let job = Job::claimed(
            gateway_description(false),
            AcquisitionPath::MongoVerified,
            "w1",
        );
        assert!(job.bypasses_gateway());
    }

    #[test]
    fn test_transition_forward_only() {
        let mut job = Job::claimed(gateway_description(false), AcquisitionPath::Gateway, "w1");
        job.transition(JobStatus::Downloading).unwrap();
        job.transition(JobStatus::Running).unwrap();
        assert!(job.transition(JobStatus::Downloading).is_err());
        job.transition(JobStatus::Uploading).unwrap();

        let cid = ContentAddress::parse("QmOut").unwrap();
        job.complete(JobResult::new(cid, 10)).unwrap();
        assert!(job.is_terminal());
        assert!(job.fail("late").is_err());
    }

    #[test]
    fn test_takeover_is_sticky() {
        let mut job = Job::claimed(gateway_description(false), AcquisitionPath::Gateway, "w1");
        job.mark_defensive_takeover();
        job.mark_defensive_takeover();
        assert!(job.bypasses_gateway());
    }

    #[test]
    fn test_profile_selection_branches_on_source() {
        let gateway = gateway_description(false).source;
        assert_eq!(gateway.select_profiles(&[]).unwrap().len(), 3);
        assert_eq!(gateway.duration_limit_secs(), None);

        let short = gateway_description(true).source;
        let picked = short
            .select_profiles(&[EncodingProfile::p1080(), EncodingProfile::p720()])
            .unwrap();
        assert_eq!(picked, vec![EncodingProfile::p720()]);
        assert_eq!(short.duration_limit_secs(), Some(SHORT_VIDEO_MAX_SECS));

        let direct = JobSource::Direct {
            owner: "bob".into(),
            api_client: "uploader".into(),
            max_duration_secs: Some(600),
        };
        assert!(direct.select_profiles(&[]).is_err());
        assert_eq!(direct.duration_limit_secs(), Some(600));
    }

    #[test]
    fn test_source_discriminant_is_required() {
        let json = r#"{"owner":"alice","permlink":"p"}"#;
        assert!(serde_json::from_str::<JobSource>(json).is_err());

        let json = r#"{"source":"gateway","owner":"alice","permlink":"p"}"#;
        let source: JobSource = serde_json::from_str(json).unwrap();
        assert_eq!(source.kind(), "gateway");
    }

    #[test]
    fn test_result_playlist_uri() {
        let result = JobResult::new(ContentAddress::parse("QmOut").unwrap(), 0);
        assert_eq!(result.playlist_uri, "ipfs://QmOut/manifest.m3u8");
    }
}
