use thiserror::Error;

use adjutant_providers::ApiError;

/// Failure of one plan node. Everything a strategy can go wrong with is
/// reflected here so the coordinator's state machine and trace see it.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum NodeError {
    #[error("reauthorization required for {provider}: {reason}")]
    NeedsReauth { provider: String, reason: String },

    #[error("provider call failed: {0}")]
    Api(ApiError),

    #[error("{service} unavailable, retry after {retry_after_ms}ms")]
    ServiceUnavailable { service: String, retry_after_ms: u64 },

    #[error("LLM call failed: {0}")]
    Llm(String),

    #[error("bad node input: {0}")]
    BadInput(String),

    #[error("node cancelled")]
    Cancelled,

    #[error("node timed out after {ms}ms")]
    Timeout { ms: u64 },
}

impl From<ApiError> for NodeError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::NeedsReauth { provider, reason } => {
                NodeError::NeedsReauth { provider, reason }
            }
            ApiError::ServiceUnavailable {
                service,
                retry_after_ms,
            } => NodeError::ServiceUnavailable {
                service,
                retry_after_ms,
            },
            ApiError::Timeout { ms } => NodeError::Timeout { ms },
            other => NodeError::Api(other),
        }
    }
}
