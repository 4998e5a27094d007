//! Shared LLM client. One per process, OpenAI-compatible wire format,
//! wrapped with a concurrency semaphore and a per-second token bucket.
//! All decomposer/synthesizer/judge non-determinism is confined here;
//! tests inject deterministic fakes behind [`LlmClient`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use adjutant_core::config::LlmConfig;
use adjutant_core::types::Role;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system: String,
    pub messages: Vec<LlmMessage>,
    pub max_tokens: u32,
}

impl LlmRequest {
    pub fn single(system: &str, user: &str) -> Self {
        Self {
            system: system.to_string(),
            messages: vec![LlmMessage {
                role: Role::User,
                content: user.to_string(),
            }],
            max_tokens: 2048,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Client name for logging and error messages.
    fn name(&self) -> &str;

    async fn complete(&self, req: &LlmRequest) -> Result<LlmResponse, LlmError>;
}

/// OpenAI-compatible chat completions client.
pub struct HttpLlmClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl HttpLlmClient {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        }
    }

    fn build_body(&self, req: &LlmRequest) -> serde_json::Value {
        let mut messages = vec![json!({"role": "system", "content": req.system})];
        for msg in &req.messages {
            let role = match msg.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::System => "system",
            };
            messages.push(json!({"role": role, "content": msg.content}));
        }
        json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": req.max_tokens,
        })
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    model: Option<String>,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Deserialize)]
struct ApiMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn complete(&self, req: &LlmRequest) -> Result<LlmResponse, LlmError> {
        debug!(model = %self.model, "sending LLM request");
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&self.build_body(req));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await?;
        let status = resp.status().as_u16();
        if status == 429 {
            return Err(LlmError::RateLimited {
                retry_after_ms: 5_000,
            });
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "LLM API error");
            return Err(LlmError::Api {
                status,
                message: text,
            });
        }

        let api: ApiResponse = resp.json().await.map_err(|e| LlmError::Parse(e.to_string()))?;
        let content = api
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| LlmError::Parse("empty choices".to_string()))?;
        let usage = api.usage.unwrap_or(ApiUsage {
            prompt_tokens: None,
            completion_tokens: None,
        });
        Ok(LlmResponse {
            content,
            model: api.model.unwrap_or_else(|| self.model.clone()),
            tokens_in: usage.prompt_tokens.unwrap_or(0),
            tokens_out: usage.completion_tokens.unwrap_or(0),
        })
    }
}

/// Strip code fences and leading prose from an LLM reply, returning the
/// first JSON object or array found. Models wrap JSON in ```json fences
/// or preamble text often enough that every structured caller needs this.
pub fn extract_json(content: &str) -> &str {
    let trimmed = content.trim();
    let body = if let Some(rest) = trimmed.split_once("```").map(|(_, r)| r) {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        rest.split("```").next().unwrap_or(rest)
    } else {
        trimmed
    };
    let start = body.find(['{', '[']).unwrap_or(0);
    body[start..].trim()
}

struct BucketState {
    window_start: Instant,
    used: u32,
}

/// Wraps any client with a concurrency cap and a requests-per-second
/// token bucket. Shared process-wide.
pub struct RateLimitedLlm {
    inner: Arc<dyn LlmClient>,
    permits: Semaphore,
    rps: u32,
    bucket: Mutex<BucketState>,
}

impl RateLimitedLlm {
    pub fn new(inner: Arc<dyn LlmClient>, max_concurrent: usize, rps: u32) -> Self {
        Self {
            inner,
            permits: Semaphore::new(max_concurrent),
            rps,
            bucket: Mutex::new(BucketState {
                window_start: Instant::now(),
                used: 0,
            }),
        }
    }

    async fn acquire_bucket_slot(&self) {
        if self.rps == 0 {
            return;
        }
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                if bucket.window_start.elapsed() >= Duration::from_secs(1) {
                    bucket.window_start = Instant::now();
                    bucket.used = 0;
                }
                if bucket.used < self.rps {
                    bucket.used += 1;
                    None
                } else {
                    Some(Duration::from_secs(1).saturating_sub(bucket.window_start.elapsed()))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d.max(Duration::from_millis(5))).await,
            }
        }
    }
}

/// Build the process-wide client: HTTP transport wrapped with the
/// configured concurrency cap and requests-per-second bucket.
pub fn shared_client(config: &LlmConfig) -> Arc<dyn LlmClient> {
    Arc::new(RateLimitedLlm::new(
        Arc::new(HttpLlmClient::new(config)),
        config.max_concurrent,
        config.requests_per_second,
    ))
}

#[async_trait]
impl LlmClient for RateLimitedLlm {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn complete(&self, req: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let _permit = self.permits.acquire().await.map_err(|_| LlmError::Api {
            status: 0,
            message: "llm semaphore closed".to_string(),
        })?;
        self.acquire_bucket_slot().await;
        self.inner.complete(req).await
    }
}
