//! Transport-level provider calls with uniform retry, timeout, and
//! circuit breaking. Local retries live here and nowhere above.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use tracing::{debug, info, warn};

use adjutant_core::config::RetryConfig;
use adjutant_core::types::ServiceKind;

use crate::breaker::BreakerRegistry;
use crate::error::ApiError;
use crate::token::{AccessToken, TokenError, TokenProvider};

/// Raw provider call boundary. Implementations map their wire errors into
/// the [`ApiError`] taxonomy; everything above sees nothing else.
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    async fn invoke(
        &self,
        service: ServiceKind,
        method: &str,
        params: &Value,
        token: &AccessToken,
    ) -> Result<Value, ApiError>;
}

/// OAuth scopes required per service domain.
pub fn required_scopes(service: ServiceKind) -> &'static [&'static str] {
    match service {
        ServiceKind::Email => &["mail.read"],
        ServiceKind::Calendar => &["read_calendar"],
        ServiceKind::Contacts => &["contacts.read"],
        ServiceKind::Llm => &[],
    }
}

/// One logical provider call: token resolution, breaker gate, per-call
/// timeout, jittered retries on `RateLimited`/`Transient5xx`, one
/// opportunistic token refresh on `Auth`.
pub struct ApiClient {
    transport: Arc<dyn ProviderTransport>,
    tokens: Arc<TokenProvider>,
    breakers: Arc<BreakerRegistry>,
    retry: RetryConfig,
    call_timeout: Duration,
}

impl ApiClient {
    pub fn new(
        transport: Arc<dyn ProviderTransport>,
        tokens: Arc<TokenProvider>,
        breakers: Arc<BreakerRegistry>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            transport,
            tokens,
            breakers,
            retry,
            call_timeout: Duration::from_secs(8),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub async fn call(
        &self,
        user: &str,
        provider_id: &str,
        service: ServiceKind,
        method: &str,
        params: Value,
    ) -> Result<Value, ApiError> {
        let breaker = self.breakers.for_service(service.as_str());
        breaker.admit().map_err(|retry_after_ms| {
            debug!(service = %service, method, "breaker open, failing fast");
            ApiError::ServiceUnavailable {
                service: service.as_str().to_string(),
                retry_after_ms,
            }
        })?;

        let scopes = required_scopes(service);
        let mut token = self
            .tokens
            .get(user, provider_id, scopes)
            .await
            .map_err(map_token_err)?;

        let mut refreshed_once = false;
        let mut attempt: u32 = 0;
        loop {
            let outcome = tokio::time::timeout(
                self.call_timeout,
                self.transport.invoke(service, method, &params, &token),
            )
            .await
            .unwrap_or(Err(ApiError::Timeout {
                ms: self.call_timeout.as_millis() as u64,
            }));

            match outcome {
                Ok(value) => {
                    breaker.record_success();
                    return Ok(value);
                }
                Err(ApiError::Auth(_)) if !refreshed_once => {
                    // One opportunistic refresh, then a single retry.
                    info!(service = %service, method, "auth error, refreshing token");
                    refreshed_once = true;
                    token = self
                        .tokens
                        .refresh(user, provider_id)
                        .await
                        .map_err(map_token_err)
                        .map_err(|e| {
                            warn!(service = %service, error = %e, "refresh after auth error failed");
                            e
                        })?;
                }
                Err(err) if err.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    attempt += 1;
                    let delay = self.backoff(attempt, &err);
                    warn!(
                        service = %service,
                        method,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying provider call"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if err.counts_for_breaker() {
                        breaker.record_failure();
                    }
                    return Err(err);
                }
            }
        }
    }

    fn backoff(&self, attempt: u32, err: &ApiError) -> Duration {
        // Server-provided retry-after wins over the computed schedule.
        if let ApiError::RateLimited { retry_after_ms } = err {
            if *retry_after_ms > 0 {
                return Duration::from_millis((*retry_after_ms).min(self.retry.max_delay_ms));
            }
        }
        let exp = self
            .retry
            .base_delay_ms
            .saturating_mul(1u64 << (attempt - 1).min(16))
            .min(self.retry.max_delay_ms);
        let ms = if self.retry.jitter {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            (exp as f64 * factor) as u64
        } else {
            exp
        };
        Duration::from_millis(ms.max(1))
    }
}

fn map_token_err(err: TokenError) -> ApiError {
    match err {
        TokenError::NeedsReauth { provider, reason } => ApiError::NeedsReauth { provider, reason },
        TokenError::Transient(msg) => ApiError::Unknown(format!("token refresh: {msg}")),
        TokenError::Store(msg) => ApiError::Unknown(format!("token store: {msg}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{AuthExchanger, InMemoryTokenStore, RefreshError, RefreshGrant, TokenRecord, TokenStore};
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedTransport {
        calls: AtomicUsize,
        failures_before_success: usize,
        failure: ApiError,
    }

    #[async_trait]
    impl ProviderTransport for ScriptedTransport {
        async fn invoke(
            &self,
            _service: ServiceKind,
            _method: &str,
            _params: &Value,
            _token: &AccessToken,
        ) -> Result<Value, ApiError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                Err(self.failure.clone())
            } else {
                Ok(json!({"items": []}))
            }
        }
    }

    struct NoRefresh;

    #[async_trait]
    impl AuthExchanger for NoRefresh {
        async fn exchange(
            &self,
            _provider: &str,
            _refresh_token: &str,
        ) -> Result<RefreshGrant, RefreshError> {
            Ok(RefreshGrant {
                access_token: "refreshed".to_string(),
                refresh_token: None,
                expires_in: 3600,
                scope: None,
            })
        }
    }

    async fn client_with(
        transport: Arc<ScriptedTransport>,
        retry: RetryConfig,
    ) -> ApiClient {
        let store = Arc::new(InMemoryTokenStore::new());
        store
            .save(
                "u1",
                "google",
                &TokenRecord {
                    access: "tok".to_string(),
                    refresh: "ref".to_string(),
                    expires_at: chrono::Utc::now().timestamp() + 3600,
                    scope: BTreeSet::from(["mail.read".to_string()]),
                    updated_at: 0,
                    revoked: false,
                },
            )
            .await
            .unwrap();
        let tokens = Arc::new(crate::token::TokenProvider::new(store, Arc::new(NoRefresh)));
        ApiClient::new(
            transport,
            tokens,
            Arc::new(BreakerRegistry::default()),
            retry,
        )
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn transient_errors_retry_until_success() {
        let transport = Arc::new(ScriptedTransport {
            calls: AtomicUsize::new(0),
            failures_before_success: 2,
            failure: ApiError::Transient5xx {
                status: 503,
                message: "try later".to_string(),
            },
        });
        let client = client_with(Arc::clone(&transport), fast_retry()).await;
        let value = client
            .call("u1", "google", ServiceKind::Email, "search", json!({}))
            .await
            .unwrap();
        assert_eq!(value, json!({"items": []}));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_immediately() {
        let transport = Arc::new(ScriptedTransport {
            calls: AtomicUsize::new(0),
            failures_before_success: 10,
            failure: ApiError::NotFound("thread".to_string()),
        });
        let client = client_with(Arc::clone(&transport), fast_retry()).await;
        let err = client
            .call("u1", "google", ServiceKind::Email, "get_threads", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, ApiError::NotFound("thread".to_string()));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auth_error_refreshes_once_then_retries() {
        let transport = Arc::new(ScriptedTransport {
            calls: AtomicUsize::new(0),
            failures_before_success: 1,
            failure: ApiError::Auth("expired".to_string()),
        });
        let client = client_with(Arc::clone(&transport), fast_retry()).await;
        let value = client
            .call("u1", "google", ServiceKind::Email, "search", json!({}))
            .await
            .unwrap();
        assert_eq!(value, json!({"items": []}));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn open_breaker_fails_fast_without_transport_call() {
        let transport = Arc::new(ScriptedTransport {
            calls: AtomicUsize::new(0),
            failures_before_success: 0,
            failure: ApiError::Unknown("unused".to_string()),
        });
        let client = client_with(Arc::clone(&transport), fast_retry()).await;
        let breaker = client.breakers().for_service("email");
        for _ in 0..5 {
            breaker.record_failure();
        }

        let err = client
            .call("u1", "google", ServiceKind::Email, "search", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::ServiceUnavailable { .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_scope_surfaces_needs_reauth() {
        let transport = Arc::new(ScriptedTransport {
            calls: AtomicUsize::new(0),
            failures_before_success: 0,
            failure: ApiError::Unknown("unused".to_string()),
        });
        let client = client_with(Arc::clone(&transport), fast_retry()).await;
        let err = client
            .call("u1", "google", ServiceKind::Calendar, "list_events", json!({}))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ApiError::NeedsReauth {
                provider: "google".to_string(),
                reason: "scope".to_string()
            }
        );
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }
}
