//! Job store error types.

use thiserror::Error;

pub type JobStoreResult<T> = Result<T, JobStoreError>;

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Job already exists: {0}")]
    AlreadyExists(String),

    #[error("Corrupt job record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },

    #[error("Store operation timed out: {0}")]
    Timeout(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl JobStoreError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    pub fn corrupt(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptRecord {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Network-level failures worth retrying on the next tick.
    pub fn is_transient(&self) -> bool {
        match self {
            JobStoreError::ConnectionFailed(_) | JobStoreError::Timeout(_) => true,
            JobStoreError::Redis(e) => {
                e.is_io_error() || e.is_timeout() || e.is_connection_dropped()
            }
            _ => false,
        }
    }
}
