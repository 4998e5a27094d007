//! Per-request coalescing and batching of provider calls.
//!
//! A loader is constructed at request entry and discarded at response;
//! nothing here outlives the request, so results can never be stale.
//! Identical `(service, method, canonical-params)` keys share a single
//! in-flight future and its (cloned) outcome, success or error. ID-keyed
//! fetches additionally coalesce into provider batch calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use adjutant_core::config::{BATCH_WINDOW_MS, MAX_BATCH_SIZE};
use adjutant_core::types::ServiceKind;

use crate::client::ApiClient;
use crate::error::ApiError;

type SharedCall = Shared<BoxFuture<'static, Result<Arc<Value>, ApiError>>>;
type BatchWaiter = oneshot::Sender<Result<Arc<Value>, ApiError>>;

/// Stable key over `(service, method, params)` with object keys sorted.
fn call_key(service: ServiceKind, method: &str, params: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(service.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(method.as_bytes());
    hasher.update(b"|");
    hasher.update(canonicalize(params).as_bytes());
    hex::encode(hasher.finalize())
}

fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, canonicalize(&map[k])))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

pub struct DataLoader {
    client: Arc<ApiClient>,
    user: String,
    enrolled: std::collections::BTreeMap<ServiceKind, String>,
    inflight: Mutex<HashMap<String, SharedCall>>,
    batches: Mutex<HashMap<(ServiceKind, String), Vec<(String, BatchWaiter)>>>,
    issued: Arc<AtomicUsize>,
    batch_window: Duration,
    max_batch: usize,
}

impl DataLoader {
    pub fn new(
        client: Arc<ApiClient>,
        user: &str,
        enrolled: std::collections::BTreeMap<ServiceKind, String>,
    ) -> Self {
        Self {
            client,
            user: user.to_string(),
            enrolled,
            inflight: Mutex::new(HashMap::new()),
            batches: Mutex::new(HashMap::new()),
            issued: Arc::new(AtomicUsize::new(0)),
            batch_window: Duration::from_millis(BATCH_WINDOW_MS),
            max_batch: MAX_BATCH_SIZE,
        }
    }

    /// Underlying provider calls issued through this loader. Test hook for
    /// the coalescing invariant.
    pub fn issued_calls(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    fn provider_for(&self, service: ServiceKind) -> Result<String, ApiError> {
        self.enrolled
            .get(&service)
            .cloned()
            .ok_or_else(|| ApiError::NeedsReauth {
                provider: service.as_str().to_string(),
                reason: "not_enrolled".to_string(),
            })
    }

    /// Load one logical call, coalescing identical keys in this request.
    pub async fn load(
        &self,
        service: ServiceKind,
        method: &str,
        params: Value,
    ) -> Result<Arc<Value>, ApiError> {
        let provider_id = self.provider_for(service)?;
        let key = call_key(service, method, &params);

        let shared = {
            let mut inflight = self.inflight.lock().await;
            if let Some(existing) = inflight.get(&key) {
                debug!(service = %service, method, "loader coalesced duplicate call");
                existing.clone()
            } else {
                let client = Arc::clone(&self.client);
                let user = self.user.clone();
                let method = method.to_string();
                let issued = Arc::clone(&self.issued);
                let fut = async move {
                    issued.fetch_add(1, Ordering::SeqCst);
                    client
                        .call(&user, &provider_id, service, &method, params)
                        .await
                        .map(Arc::new)
                }
                .boxed()
                .shared();
                inflight.insert(key, fut.clone());
                fut
            }
        };

        shared.await
    }

    /// Fetch one item by id through the service's batch method. Ids issued
    /// within the coalesce window are grouped into a single provider call
    /// of at most `max_batch` ids.
    pub async fn load_batched(
        &self,
        service: ServiceKind,
        method: &str,
        id: &str,
    ) -> Result<Arc<Value>, ApiError> {
        let (tx, rx) = oneshot::channel();
        let (is_first, flush_now) = {
            let mut batches = self.batches.lock().await;
            let pending = batches.entry((service, method.to_string())).or_default();
            pending.push((id.to_string(), tx));
            (pending.len() == 1, pending.len() >= self.max_batch)
        };

        if flush_now {
            self.flush(service, method).await;
        } else if is_first {
            // First waiter arms the window timer for this batch key.
            tokio::time::sleep(self.batch_window).await;
            self.flush(service, method).await;
        }

        rx.await
            .unwrap_or_else(|_| Err(ApiError::Unknown("batch waiter dropped".to_string())))
    }

    async fn flush(&self, service: ServiceKind, method: &str) {
        let pending = {
            let mut batches = self.batches.lock().await;
            match batches.remove(&(service, method.to_string())) {
                Some(p) if !p.is_empty() => p,
                _ => return,
            }
        };

        let mut ids: Vec<String> = pending.iter().map(|(id, _)| id.clone()).collect();
        ids.sort();
        ids.dedup();
        debug!(service = %service, method, batch = ids.len(), "flushing batched ids");

        let result = self
            .load(service, method, json!({ "ids": ids }))
            .await;

        for (id, waiter) in pending {
            let outcome = match &result {
                Ok(value) => match value.get("items").and_then(|items| items.get(&id)) {
                    Some(item) => Ok(Arc::new(item.clone())),
                    None => Err(ApiError::NotFound(id.clone())),
                },
                Err(e) => Err(e.clone()),
            };
            let _ = waiter.send(outcome);
        }
    }
}
