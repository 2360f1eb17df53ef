//! Model validation errors.

use thiserror::Error;

use crate::job_status::JobStatus;
use crate::pin::{PinStatus, TargetNode};

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("Invalid job transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Invalid pin transition: {from:?} -> {to:?}")]
    InvalidPinTransition { from: PinStatus, to: PinStatus },

    #[error("Verification on {verified:?} does not match pin target {pinned:?}")]
    VerifierNodeMismatch {
        pinned: TargetNode,
        verified: TargetNode,
    },

    #[error("Invalid content address: {0}")]
    InvalidContentAddress(String),

    #[error("Invalid job: {0}")]
    InvalidJob(String),
}

impl ModelError {
    pub fn invalid_job(msg: impl Into<String>) -> Self {
        Self::InvalidJob(msg.into())
    }
}
