//! Gateway error types.

use thiserror::Error;

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors that can occur talking to the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Gateway not configured: {0}")]
    NotConfigured(String),

    #[error("Request signing failed: {0}")]
    Signing(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limited, retry after {0}ms")]
    RateLimited(u64),

    #[error("Server error ({0}): {1}")]
    ServerError(u16, String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Gateway call timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    pub fn request_failed(msg: impl Into<String>) -> Self {
        Self::RequestFailed(msg.into())
    }

    pub fn signing(msg: impl Into<String>) -> Self {
        Self::Signing(msg.into())
    }

    /// Map a non-success HTTP status to an error.
    pub fn from_http_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 | 403 => Self::Unauthorized(body),
            404 => Self::NotFound(body),
            409 => Self::Conflict(body),
            429 => Self::RateLimited(1000),
            500..=599 => Self::ServerError(status, body),
            _ => Self::RequestFailed(format!("HTTP {}: {}", status, body)),
        }
    }

    /// Transient-remote failures: retried with backoff, never fatal to a job.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Network(_)
                | GatewayError::Timeout(_)
                | GatewayError::RateLimited(_)
                | GatewayError::ServerError(_, _)
        )
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited(ms) => Some(*ms),
            _ => None,
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            GatewayError::Unauthorized(_) => Some(401),
            GatewayError::NotFound(_) => Some(404),
            GatewayError::Conflict(_) => Some(409),
            GatewayError::RateLimited(_) => Some(429),
            GatewayError::ServerError(status, _) => Some(*status),
            GatewayError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_from_http_status_5xx() {
        for status in [500, 502, 503, 504] {
            let err = GatewayError::from_http_status(status, "down");
            assert!(matches!(err, GatewayError::ServerError(s, _) if s == status));
            assert!(err.is_retryable(), "{} should be retryable", status);
        }
    }

    #[test]
    fn test_error_from_http_status_4xx() {
        assert!(matches!(
            GatewayError::from_http_status(404, "gone"),
            GatewayError::NotFound(_)
        ));
        assert!(matches!(
            GatewayError::from_http_status(409, "taken"),
            GatewayError::Conflict(_)
        ));
        let err = GatewayError::from_http_status(400, "bad");
        assert!(matches!(err, GatewayError::RequestFailed(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_rate_limited_is_retryable_with_delay() {
        let err = GatewayError::from_http_status(429, "slow down");
        assert!(err.is_retryable());
        assert_eq!(err.retry_after_ms(), Some(1000));
        assert_eq!(err.http_status(), Some(429));
    }
}
