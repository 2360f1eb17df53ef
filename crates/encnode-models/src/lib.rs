//! Shared data models for the encoder node.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs, their lifecycle and acquisition paths
//! - Job sources (gateway vs direct API) and encoding profiles
//! - Pin records tracking persistence of content addresses

pub mod error;
pub mod job;
pub mod job_status;
pub mod pin;
pub mod profile;

// Re-export common types
pub use error::{ModelError, ModelResult};
pub use job::{AcquisitionPath, Job, JobDescription, JobId, JobResult, JobSource};
pub use job_status::JobStatus;
pub use pin::{ContentAddress, ContentKind, PinRecord, PinStatus, TargetNode};
pub use profile::EncodingProfile;
