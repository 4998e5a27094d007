//! Token lifecycle for `(user, provider)` credentials.
//!
//! Flow per `get()`:
//!   1. Fast path — stored token has scope coverage and enough TTL left.
//!   2. Slow path — per-(user, provider) mutex, re-check, refresh through
//!      the exchanger, persist, return.
//! Concurrent gets for the same key coalesce to a single refresh call.
//!
//! `expires_at` (absolute unix seconds) is the authoritative expiry. The
//! legacy `expiry_date` millisecond hint is converted on load and never
//! trusted when both are present. Raw secrets never appear in logs — only
//! SHA-256 fingerprints.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use adjutant_core::config::{TOKEN_REFRESH_MARGIN_SECS, TOKEN_REFRESH_MAX_ATTEMPTS};

/// Short non-reversible identifier for a secret, safe to log.
pub fn fingerprint(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())[..8].to_string()
}

/// A currently-valid access token handed to the ApiClient for one call.
/// Never serialized, never logged in raw form.
#[derive(Clone)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn secret(&self) -> &str {
        &self.0
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.0)
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AccessToken({})", self.fingerprint())
    }
}

/// Stored credential state for one `(user, provider)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access: String,
    pub refresh: String,
    /// Absolute unix seconds. Authoritative.
    pub expires_at: i64,
    pub scope: BTreeSet<String>,
    pub updated_at: i64,
    #[serde(default)]
    pub revoked: bool,
}

impl TokenRecord {
    /// Build from wire fields where only the legacy millisecond
    /// `expiry_date` may be present.
    pub fn from_wire(
        access: String,
        refresh: String,
        expires_at: Option<i64>,
        legacy_expiry_date_ms: Option<i64>,
        scope: BTreeSet<String>,
    ) -> Self {
        let expires_at = match (expires_at, legacy_expiry_date_ms) {
            (Some(secs), _) => secs,
            (None, Some(ms)) => {
                debug!("token record carried only legacy expiry_date hint, converting");
                ms / 1000
            }
            (None, None) => 0,
        };
        Self {
            access,
            refresh,
            expires_at,
            scope,
            updated_at: chrono::Utc::now().timestamp(),
            revoked: false,
        }
    }

    fn fresh_for(&self, now: i64, margin_secs: i64) -> bool {
        self.expires_at - now > margin_secs
    }

    fn covers(&self, scopes: &[&str]) -> bool {
        scopes.iter().all(|s| self.scope.contains(*s))
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TokenError {
    #[error("reauthorization required for {provider}: {reason}")]
    NeedsReauth { provider: String, reason: String },

    #[error("transient token refresh failure: {0}")]
    Transient(String),

    #[error("token store failure: {0}")]
    Store(String),
}

/// Result of a successful refresh-token exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: u64,
    /// Space-separated scope string, when the provider reports it.
    pub scope: Option<String>,
}

/// Terminal-vs-transient classification of a failed exchange.
#[derive(Debug, Clone, Error)]
pub enum RefreshError {
    #[error("transient refresh failure: {0}")]
    Transient(String),

    #[error("refresh token revoked: {0}")]
    Revoked(String),

    #[error("consent required: {0}")]
    ConsentRequired(String),
}

/// Credential persistence boundary. The backing store itself is an external
/// collaborator; an in-memory implementation is provided for tests and
/// single-process deployments.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self, user: &str, provider: &str) -> Result<Option<TokenRecord>, TokenError>;
    async fn save(&self, user: &str, provider: &str, record: &TokenRecord)
        -> Result<(), TokenError>;
}

#[derive(Default)]
pub struct InMemoryTokenStore {
    records: DashMap<(String, String), TokenRecord>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn load(&self, user: &str, provider: &str) -> Result<Option<TokenRecord>, TokenError> {
        Ok(self
            .records
            .get(&(user.to_string(), provider.to_string()))
            .map(|r| r.clone()))
    }

    async fn save(
        &self,
        user: &str,
        provider: &str,
        record: &TokenRecord,
    ) -> Result<(), TokenError> {
        self.records
            .insert((user.to_string(), provider.to_string()), record.clone());
        Ok(())
    }
}

/// OAuth refresh exchange boundary (the token endpoint network call).
#[async_trait]
pub trait AuthExchanger: Send + Sync {
    async fn exchange(
        &self,
        provider: &str,
        refresh_token: &str,
    ) -> Result<RefreshGrant, RefreshError>;
}

/// Exchanges refresh tokens against a configured OAuth token endpoint.
pub struct HttpAuthExchanger {
    client: reqwest::Client,
    clients: DashMap<String, adjutant_core::config::OAuthClientConfig>,
}

impl HttpAuthExchanger {
    pub fn new(providers: &adjutant_core::config::ProvidersConfig) -> Self {
        let clients = DashMap::new();
        if let Some(cfg) = &providers.google {
            clients.insert("google".to_string(), cfg.clone());
        }
        if let Some(cfg) = &providers.microsoft {
            clients.insert("microsoft".to_string(), cfg.clone());
        }
        Self {
            client: reqwest::Client::new(),
            clients,
        }
    }
}

#[async_trait]
impl AuthExchanger for HttpAuthExchanger {
    async fn exchange(
        &self,
        provider: &str,
        refresh_token: &str,
    ) -> Result<RefreshGrant, RefreshError> {
        let cfg = self
            .clients
            .get(provider)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RefreshError::ConsentRequired(format!("unknown provider {provider}")))?;

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", cfg.client_id.as_str()),
            ("client_secret", cfg.client_secret.as_str()),
        ];

        let resp = self
            .client
            .post(&cfg.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| RefreshError::Transient(e.to_string()))?;

        let status = resp.status().as_u16();
        if status >= 500 {
            return Err(RefreshError::Transient(format!("token endpoint {status}")));
        }
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            // OAuth error codes: invalid_grant / interaction_required are
            // terminal; everything else client-side is treated as revoked.
            if body.contains("consent_required") || body.contains("interaction_required") {
                return Err(RefreshError::ConsentRequired(body));
            }
            return Err(RefreshError::Revoked(body));
        }

        resp.json::<RefreshGrant>()
            .await
            .map_err(|e| RefreshError::Transient(format!("grant parse: {e}")))
    }
}

/// Supplies valid tokens and owns every refresh. Refreshes for the same
/// `(user, provider)` are serialized through a keyed mutex.
pub struct TokenProvider {
    store: Arc<dyn TokenStore>,
    exchanger: Arc<dyn AuthExchanger>,
    locks: DashMap<(String, String), Arc<Mutex<()>>>,
    margin_secs: i64,
}

impl TokenProvider {
    pub fn new(store: Arc<dyn TokenStore>, exchanger: Arc<dyn AuthExchanger>) -> Self {
        Self {
            store,
            exchanger,
            locks: DashMap::new(),
            margin_secs: TOKEN_REFRESH_MARGIN_SECS,
        }
    }

    pub fn with_margin_secs(mut self, margin_secs: i64) -> Self {
        self.margin_secs = margin_secs;
        self
    }

    fn lock_for(&self, user: &str, provider: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry((user.to_string(), provider.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Return a token valid for at least the refresh margin whose scope set
    /// covers `scopes`, refreshing if needed. Scope mismatch never retries.
    pub async fn get(
        &self,
        user: &str,
        provider: &str,
        scopes: &[&str],
    ) -> Result<AccessToken, TokenError> {
        let now = chrono::Utc::now().timestamp();

        // Fast path — no lock.
        if let Some(record) = self.store.load(user, provider).await? {
            if record.revoked {
                return Err(self.reauth(provider, "revoked"));
            }
            if !record.covers(scopes) {
                return Err(self.reauth(provider, "scope"));
            }
            if record.fresh_for(now, self.margin_secs) {
                return Ok(AccessToken(record.access));
            }
        } else {
            return Err(self.reauth(provider, "no_token"));
        }

        // Slow path — keyed mutex, re-check, refresh.
        let lock = self.lock_for(user, provider);
        let _guard = lock.lock().await;

        let now = chrono::Utc::now().timestamp();
        let record = self
            .store
            .load(user, provider)
            .await?
            .ok_or_else(|| self.reauth(provider, "no_token"))?;
        if record.revoked {
            return Err(self.reauth(provider, "revoked"));
        }
        if !record.covers(scopes) {
            return Err(self.reauth(provider, "scope"));
        }
        if record.fresh_for(now, self.margin_secs) {
            return Ok(AccessToken(record.access));
        }

        let refreshed = self.refresh_locked(user, provider, record).await?;
        if !refreshed.covers(scopes) {
            // Provider narrowed the grant during refresh.
            return Err(self.reauth(provider, "scope"));
        }
        Ok(AccessToken(refreshed.access))
    }

    /// Force a refresh regardless of remaining TTL (used by the ApiClient
    /// after an auth error). Serialized with `get()` refreshes.
    pub async fn refresh(&self, user: &str, provider: &str) -> Result<AccessToken, TokenError> {
        let lock = self.lock_for(user, provider);
        let _guard = lock.lock().await;

        let record = self
            .store
            .load(user, provider)
            .await?
            .ok_or_else(|| self.reauth(provider, "no_token"))?;
        if record.revoked {
            return Err(self.reauth(provider, "revoked"));
        }
        let refreshed = self.refresh_locked(user, provider, record).await?;
        Ok(AccessToken(refreshed.access))
    }

    /// Mark the stored token unusable; subsequent gets surface reauth.
    pub async fn invalidate(&self, user: &str, provider: &str) -> Result<(), TokenError> {
        if let Some(mut record) = self.store.load(user, provider).await? {
            record.revoked = true;
            record.updated_at = chrono::Utc::now().timestamp();
            self.store.save(user, provider, &record).await?;
            info!(provider, token = %fingerprint(&record.access), "token invalidated");
        }
        Ok(())
    }

    async fn refresh_locked(
        &self,
        user: &str,
        provider: &str,
        current: TokenRecord,
    ) -> Result<TokenRecord, TokenError> {
        let mut last_transient = String::new();
        for attempt in 0..TOKEN_REFRESH_MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(100 * (1 << attempt))).await;
            }
            match self.exchanger.exchange(provider, &current.refresh).await {
                Ok(grant) => {
                    let now = chrono::Utc::now().timestamp();
                    let scope = match &grant.scope {
                        Some(s) => s.split_whitespace().map(str::to_string).collect(),
                        None => current.scope.clone(),
                    };
                    let record = TokenRecord {
                        access: grant.access_token,
                        refresh: grant
                            .refresh_token
                            .unwrap_or_else(|| current.refresh.clone()),
                        expires_at: now + grant.expires_in as i64,
                        scope,
                        updated_at: now,
                        revoked: false,
                    };
                    self.store.save(user, provider, &record).await?;
                    info!(
                        provider,
                        token = %fingerprint(&record.access),
                        expires_at = record.expires_at,
                        "token refreshed"
                    );
                    return Ok(record);
                }
                Err(RefreshError::Transient(msg)) => {
                    warn!(provider, attempt, error = %msg, "transient token refresh failure");
                    last_transient = msg;
                }
                Err(RefreshError::Revoked(msg)) => {
                    warn!(provider, error = %msg, "refresh token revoked");
                    self.invalidate(user, provider).await?;
                    return Err(self.reauth(provider, "revoked"));
                }
                Err(RefreshError::ConsentRequired(msg)) => {
                    warn!(provider, error = %msg, "consent required");
                    return Err(self.reauth(provider, "consent_required"));
                }
            }
        }
        Err(TokenError::Transient(last_transient))
    }

    fn reauth(&self, provider: &str, reason: &str) -> TokenError {
        TokenError::NeedsReauth {
            provider: provider.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExchanger {
        calls: AtomicUsize,
        outcome: fn() -> Result<RefreshGrant, RefreshError>,
    }

    impl CountingExchanger {
        fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                outcome: || {
                    Ok(RefreshGrant {
                        access_token: "fresh-access".to_string(),
                        refresh_token: None,
                        expires_in: 3600,
                        scope: None,
                    })
                },
            }
        }

        fn revoked() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                outcome: || Err(RefreshError::Revoked("invalid_grant".to_string())),
            }
        }
    }

    #[async_trait]
    impl AuthExchanger for CountingExchanger {
        async fn exchange(
            &self,
            _provider: &str,
            _refresh_token: &str,
        ) -> Result<RefreshGrant, RefreshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.outcome)()
        }
    }

    fn expired_record() -> TokenRecord {
        TokenRecord {
            access: "stale-access".to_string(),
            refresh: "refresh-1".to_string(),
            expires_at: chrono::Utc::now().timestamp() - 10,
            scope: ["mail.read".to_string()].into_iter().collect(),
            updated_at: 0,
            revoked: false,
        }
    }

    #[tokio::test]
    async fn fresh_token_returned_without_refresh() {
        let store = Arc::new(InMemoryTokenStore::new());
        let exchanger = Arc::new(CountingExchanger::ok());
        let mut record = expired_record();
        record.expires_at = chrono::Utc::now().timestamp() + 3600;
        store.save("u1", "google", &record).await.unwrap();

        let provider = TokenProvider::new(store, exchanger.clone());
        let token = provider.get("u1", "google", &["mail.read"]).await.unwrap();
        assert_eq!(token.secret(), "stale-access");
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_gets_coalesce_to_one_refresh() {
        let store = Arc::new(InMemoryTokenStore::new());
        let exchanger = Arc::new(CountingExchanger::ok());
        store.save("u1", "google", &expired_record()).await.unwrap();

        let provider = Arc::new(TokenProvider::new(store, exchanger.clone()));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let p = Arc::clone(&provider);
            handles.push(tokio::spawn(async move {
                p.get("u1", "google", &["mail.read"]).await
            }));
        }
        for h in handles {
            let token = h.await.unwrap().unwrap();
            assert_eq!(token.secret(), "fresh-access");
        }
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn scope_mismatch_is_terminal_and_never_refreshes() {
        let store = Arc::new(InMemoryTokenStore::new());
        let exchanger = Arc::new(CountingExchanger::ok());
        let mut record = expired_record();
        record.expires_at = chrono::Utc::now().timestamp() + 3600;
        store.save("u1", "google", &record).await.unwrap();

        let provider = TokenProvider::new(store, exchanger.clone());
        let err = provider
            .get("u1", "google", &["read_calendar"])
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TokenError::NeedsReauth {
                provider: "google".to_string(),
                reason: "scope".to_string()
            }
        );
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn revoked_refresh_surfaces_reauth_and_invalidates() {
        let store = Arc::new(InMemoryTokenStore::new());
        let exchanger = Arc::new(CountingExchanger::revoked());
        store.save("u1", "google", &expired_record()).await.unwrap();

        let provider = TokenProvider::new(store.clone(), exchanger);
        let err = provider.get("u1", "google", &["mail.read"]).await.unwrap_err();
        assert!(matches!(err, TokenError::NeedsReauth { ref reason, .. } if reason == "revoked"));

        let stored = store.load("u1", "google").await.unwrap().unwrap();
        assert!(stored.revoked);
    }

    #[test]
    fn legacy_expiry_hint_converted_on_load() {
        let record = TokenRecord::from_wire(
            "a".to_string(),
            "r".to_string(),
            None,
            Some(1_750_000_000_000),
            BTreeSet::new(),
        );
        assert_eq!(record.expires_at, 1_750_000_000);

        // expires_at wins when both are present
        let record = TokenRecord::from_wire(
            "a".to_string(),
            "r".to_string(),
            Some(42),
            Some(1_750_000_000_000),
            BTreeSet::new(),
        );
        assert_eq!(record.expires_at, 42);
    }

    #[test]
    fn access_token_debug_is_redacted() {
        let token = AccessToken("super-secret-value".to_string());
        let rendered = format!("{token:?}");
        assert!(!rendered.contains("super-secret-value"));
        assert!(rendered.starts_with("AccessToken("));
    }
}
