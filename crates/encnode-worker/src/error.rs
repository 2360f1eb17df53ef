//! Worker error types.

use thiserror::Error;

use encnode_gateway::GatewayError;
use encnode_jobstore::JobStoreError;
use encnode_models::ModelError;
use encnode_storage::StorageError;

pub type WorkerResult<T> = Result<T, WorkerError>;

/// How a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Network, timeout or 5xx: retried with backoff, never fatal to a job
    TransientRemote,
    /// A conditional claim or write affected nothing: another worker won
    RaceLost,
    /// A node acknowledged a pin that the verifier could not confirm
    VerificationFailed,
    /// Every node failed verification, or the job cannot produce an artifact
    ExhaustionCritical,
    /// Rejected up front (already complete, bad job, missing configuration)
    Precondition,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::TransientRemote => "transient_remote",
            FailureClass::RaceLost => "race_lost",
            FailureClass::VerificationFailed => "verification_failed",
            FailureClass::ExhaustionCritical => "exhaustion_critical",
            FailureClass::Precondition => "precondition",
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Job {0} is already complete")]
    AlreadyComplete(String),

    #[error("Claim lost: {0}")]
    ClaimLost(String),

    #[error("Encode failed: {0}")]
    EncodeFailed(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Job store error: {0}")]
    Store(#[from] JobStoreError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid job state: {0}")]
    Model(#[from] ModelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn claim_lost(msg: impl Into<String>) -> Self {
        Self::ClaimLost(msg.into())
    }

    pub fn encode_failed(msg: impl Into<String>) -> Self {
        Self::EncodeFailed(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Classify at the boundary where the error surfaced.
    pub fn class(&self) -> FailureClass {
        match self {
            WorkerError::ClaimLost(_) => FailureClass::RaceLost,
            WorkerError::AlreadyComplete(_)
            | WorkerError::Precondition(_)
            | WorkerError::ConfigError(_)
            | WorkerError::Model(_) => FailureClass::Precondition,
            WorkerError::EncodeFailed(_) | WorkerError::Io(_) => FailureClass::ExhaustionCritical,
            WorkerError::Gateway(GatewayError::Conflict(_)) => FailureClass::RaceLost,
            WorkerError::Gateway(e) if e.is_retryable() => FailureClass::TransientRemote,
            WorkerError::Gateway(_) => FailureClass::Precondition,
            WorkerError::Store(e) if e.is_transient() => FailureClass::TransientRemote,
            WorkerError::Store(_) => FailureClass::Precondition,
            WorkerError::Storage(e) if e.is_exhaustion() => FailureClass::ExhaustionCritical,
            WorkerError::Storage(StorageError::UploadFailed(_)) => FailureClass::ExhaustionCritical,
            WorkerError::Storage(StorageError::PinFailed { .. }) => FailureClass::VerificationFailed,
            WorkerError::Storage(e) if e.is_transient() => FailureClass::TransientRemote,
            WorkerError::Storage(_) => FailureClass::ExhaustionCritical,
        }
    }

    /// Only exhaustion-critical and precondition errors fail a job outright.
    pub fn is_job_failure(&self) -> bool {
        matches!(
            self.class(),
            FailureClass::ExhaustionCritical | FailureClass::Precondition
        )
    }

    pub fn is_race_lost(&self) -> bool {
        self.class() == FailureClass::RaceLost
    }
}
