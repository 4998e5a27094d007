//! Uniform error taxonomy for external provider calls. Everything a
//! transport can produce is mapped into [`ApiError`] at the ApiClient
//! boundary so upper layers never see raw HTTP errors.
//!
//! `Clone` is required: the DataLoader delivers one error to every
//! coalesced caller of the same key.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("reauthorization required for {provider}: {reason}")]
    NeedsReauth { provider: String, reason: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("call timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("transient provider error ({status}): {message}")]
    Transient5xx { status: u16, message: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{service} unavailable, retry after {retry_after_ms}ms")]
    ServiceUnavailable { service: String, retry_after_ms: u64 },

    #[error("unknown provider error: {0}")]
    Unknown(String),
}

impl ApiError {
    /// Whether the ApiClient retry loop may try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::RateLimited { .. } | ApiError::Transient5xx { .. }
        )
    }

    /// Whether the failure counts toward opening the service's breaker.
    /// Caller-side errors (bad request, missing item, permissions) do not.
    pub fn counts_for_breaker(&self) -> bool {
        matches!(
            self,
            ApiError::Timeout { .. }
                | ApiError::Transient5xx { .. }
                | ApiError::RateLimited { .. }
                | ApiError::Unknown(_)
        )
    }
}
