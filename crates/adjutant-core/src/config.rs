use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AdjutantError, Result};

// Request lifecycle limits — overridable per request up to the hard caps.
pub const DEFAULT_REQUEST_DEADLINE_MS: u64 = 30_000;
pub const MAX_REQUEST_DEADLINE_MS: u64 = 120_000;
pub const DEFAULT_NODE_TIMEOUT_MS: u64 = 10_000;

// Concurrency caps for the execution coordinator.
pub const GLOBAL_CONCURRENCY: usize = 32;
pub const EMAIL_CONCURRENCY: usize = 8;
pub const CALENDAR_CONCURRENCY: usize = 8;
pub const CONTACTS_CONCURRENCY: usize = 4;
pub const LLM_CONCURRENCY: usize = 4;

// Plan shape limits enforced by the validator.
pub const MAX_PLAN_NODES: usize = 16;
pub const MAX_RESULTS_CAP: u64 = 500;

// History truncation before the decomposer sees it (stricter bound wins).
pub const HISTORY_MAX_MESSAGES: usize = 10;
pub const HISTORY_MAX_TOKENS: usize = 5_000;

// Token lifecycle.
pub const TOKEN_REFRESH_MARGIN_SECS: i64 = 120;
pub const TOKEN_REFRESH_MAX_ATTEMPTS: u32 = 3;

// Circuit breaker tuning.
pub const BREAKER_FAILURE_THRESHOLD: u32 = 5;
pub const BREAKER_WINDOW_SECS: u64 = 30;
pub const BREAKER_COOLOFF_SECS: u64 = 15;

// DataLoader batching.
pub const MAX_BATCH_SIZE: usize = 25;
pub const BATCH_WINDOW_MS: u64 = 10;

// User-context cache TTL (cache-aside, best effort).
pub const CONTEXT_CACHE_TTL_SECS: u64 = 60;

/// Top-level config (adjutant.toml + ADJUTANT_* env overrides).
/// Read once at startup and held immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjutantConfig {
    pub llm: LlmConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl AdjutantConfig {
    /// Load from `adjutant.toml` in the working directory plus environment
    /// overrides (`ADJUTANT_LLM__API_KEY=...` style nesting).
    pub fn load() -> Result<Self> {
        Self::from_path("adjutant.toml")
    }

    pub fn from_path(path: &str) -> Result<Self> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("ADJUTANT_").split("__"))
            .extract()
            .map_err(|e| AdjutantError::Config(e.to_string()))
    }
}

impl Default for AdjutantConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            providers: ProvidersConfig::default(),
            limits: LimitsConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// LLM endpoint configuration. One shared client per process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Concurrent in-flight requests to the LLM.
    #[serde(default = "default_llm_concurrency")]
    pub max_concurrent: usize,
    /// Token-bucketed requests per second per model class.
    #[serde(default = "default_llm_rps")]
    pub requests_per_second: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: default_llm_endpoint(),
            api_key: None,
            model: default_llm_model(),
            max_concurrent: default_llm_concurrency(),
            requests_per_second: default_llm_rps(),
        }
    }
}

/// OAuth client settings for one mailbox/calendar provider (e.g. "google").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub token_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub google: Option<OAuthClientConfig>,
    #[serde(default)]
    pub microsoft: Option<OAuthClientConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_deadline_ms")]
    pub request_deadline_ms: u64,
    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,
    #[serde(default = "default_global_concurrency")]
    pub global_concurrency: usize,
    #[serde(default = "default_max_plan_nodes")]
    pub max_plan_nodes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            request_deadline_ms: DEFAULT_REQUEST_DEADLINE_MS,
            node_timeout_ms: DEFAULT_NODE_TIMEOUT_MS,
            global_concurrency: GLOBAL_CONCURRENCY,
            max_plan_nodes: MAX_PLAN_NODES,
        }
    }
}

/// Retry behaviour for transient provider errors (ApiClient layer only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts including the initial request. 1 = no retry.
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "bool_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_ms(),
            max_delay_ms: default_retry_max_ms(),
            jitter: true,
        }
    }
}

fn default_llm_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o".to_string()
}

fn default_llm_concurrency() -> usize {
    LLM_CONCURRENCY
}

fn default_llm_rps() -> u32 {
    4
}

fn default_deadline_ms() -> u64 {
    DEFAULT_REQUEST_DEADLINE_MS
}

fn default_node_timeout_ms() -> u64 {
    DEFAULT_NODE_TIMEOUT_MS
}

fn default_global_concurrency() -> usize {
    GLOBAL_CONCURRENCY
}

fn default_max_plan_nodes() -> usize {
    MAX_PLAN_NODES
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    200
}

fn default_retry_max_ms() -> u64 {
    5_000
}

fn bool_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = AdjutantConfig::default();
        assert_eq!(cfg.limits.request_deadline_ms, 30_000);
        assert_eq!(cfg.limits.node_timeout_ms, 10_000);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert!(cfg.retry.jitter);
    }

    #[test]
    fn toml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adjutant.toml");
        std::fs::write(
            &path,
            r#"
[llm]
model = "test-model"
api_key = "sk-test"

[limits]
request_deadline_ms = 5000
"#,
        )
        .unwrap();

        let cfg = AdjutantConfig::from_path(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.llm.model, "test-model");
        assert_eq!(cfg.limits.request_deadline_ms, 5000);
        // untouched sections keep defaults
        assert_eq!(cfg.limits.node_timeout_ms, 10_000);
    }
}
