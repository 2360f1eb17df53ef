//! Storage error types.

use encnode_models::{ModelError, TargetNode};
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to configure storage node: {0}")]
    ConfigError(String),

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Pin failed on {node}: {reason}")]
    PinFailed { node: TargetNode, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Node server error ({0}): {1}")]
    ServerError(u16, String),

    #[error("Node request rejected ({0}): {1}")]
    RequestFailed(u16, String),

    #[error("Node call timed out: {0}")]
    Timeout(String),

    #[error("Invalid node response: {0}")]
    InvalidResponse(String),

    #[error("No node verified {hash} after {attempts} pin attempts")]
    ExhaustionCritical { hash: String, attempts: u32 },

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl StorageError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn upload_failed(msg: impl Into<String>) -> Self {
        Self::UploadFailed(msg.into())
    }

    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }

    pub fn pin_failed(node: TargetNode, reason: impl Into<String>) -> Self {
        Self::PinFailed {
            node,
            reason: reason.into(),
        }
    }

    /// Map a non-success HTTP status from a node API.
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            404 => Self::NotFound(message),
            500..=599 => Self::ServerError(status, message),
            _ => Self::RequestFailed(status, message),
        }
    }

    /// Network, timeout and 5xx failures.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::ServerError(_, _)
        )
    }

    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::ExhaustionCritical { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(StorageError::from_http_status(503, "busy").is_transient());
        assert!(!StorageError::from_http_status(400, "bad arg").is_transient());
        assert!(matches!(
            StorageError::from_http_status(404, "gone"),
            StorageError::NotFound(_)
        ));
    }

    #[test]
    fn test_exhaustion_is_not_transient() {
        let err = StorageError::ExhaustionCritical {
            hash: "QmX".into(),
            attempts: 9,
        };
        assert!(err.is_exhaustion());
        assert!(!err.is_transient());
    }
}
