use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdjutantError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Reauthorization required for {provider}: {reason}")]
    NeedsReauth { provider: String, reason: String },

    #[error("Plan rejected: {0}")]
    PlanRejected(String),

    #[error("Request deadline exceeded after {ms}ms")]
    DeadlineExceeded { ms: u64 },

    #[error("Service {service} unavailable, retry after {retry_after_ms}ms")]
    ServiceUnavailable { service: String, retry_after_ms: u64 },

    #[error("LLM provider error: {0}")]
    Llm(String),

    #[error("Provider call failed: {0}")]
    Provider(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AdjutantError {
    /// Short error code string carried in the reply envelope.
    pub fn code(&self) -> &'static str {
        match self {
            AdjutantError::Config(_) => "CONFIG_ERROR",
            AdjutantError::NeedsReauth { .. } => "NEEDS_REAUTH",
            AdjutantError::PlanRejected(_) => "PLAN_REJECTED",
            AdjutantError::DeadlineExceeded { .. } => "DEADLINE_EXCEEDED",
            AdjutantError::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            AdjutantError::Llm(_) => "LLM_PROVIDER_ERROR",
            AdjutantError::Provider(_) => "PROVIDER_ERROR",
            AdjutantError::Serialization(_) => "SERIALIZATION_ERROR",
            AdjutantError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, AdjutantError>;
