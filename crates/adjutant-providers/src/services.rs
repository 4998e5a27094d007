//! Typed façades over the per-request DataLoader. Strategies talk to
//! these; nothing above this layer sees raw provider JSON.
//!
//! Transport payload contract: list methods return
//! `{"items": [...], "truncated": bool?}`; the batched `get_threads`
//! method returns `{"items": {"<id>": {...}}}`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use adjutant_core::types::ServiceKind;

use crate::error::ApiError;
use crate::loader::DataLoader;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    #[serde(default)]
    pub name: Option<String>,
    pub email: String,
}

impl Address {
    pub fn domain(&self) -> &str {
        self.email.rsplit('@').next().unwrap_or("")
    }
}

/// Provider-supplied email metadata; the body lives in [`EmailThread`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailHandle {
    pub id: String,
    pub thread_id: String,
    pub from: Address,
    #[serde(default)]
    pub to: Vec<Address>,
    pub subject: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub unread: bool,
    #[serde(default)]
    pub important: bool,
    #[serde(default)]
    pub has_attachment: bool,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub id: String,
    pub from: Address,
    pub body: String,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailThread {
    pub id: String,
    pub subject: String,
    #[serde(default)]
    pub messages: Vec<EmailMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub attendees: Vec<Address>,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub org: Option<String>,
}

/// One page of list results with the provider's truncation hint.
#[derive(Debug, Clone)]
pub struct SearchPage<T> {
    pub items: Vec<T>,
    pub truncated: bool,
}

fn parse_page<T: serde::de::DeserializeOwned>(value: &Value) -> Result<SearchPage<T>, ApiError> {
    let items = value
        .get("items")
        .cloned()
        .unwrap_or_else(|| json!([]));
    let items: Vec<T> = serde_json::from_value(items)
        .map_err(|e| ApiError::Unknown(format!("malformed provider payload: {e}")))?;
    let truncated = value
        .get("truncated")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Ok(SearchPage { items, truncated })
}

#[derive(Clone)]
pub struct MailService {
    loader: Arc<DataLoader>,
}

impl MailService {
    pub fn new(loader: Arc<DataLoader>) -> Self {
        Self { loader }
    }

    /// Provider-native search. `query` is the already-validated operator
    /// string (e.g. `"is:unread newer_than:7d"`) or free text.
    pub async fn search(
        &self,
        query: &str,
        max_results: u64,
    ) -> Result<SearchPage<EmailHandle>, ApiError> {
        let resp = self
            .loader
            .load(
                ServiceKind::Email,
                "search",
                json!({"q": query, "max_results": max_results}),
            )
            .await?;
        parse_page(&resp)
    }

    /// Fetch one full thread; ids issued close together batch into a
    /// single provider call.
    pub async fn get_thread(&self, thread_id: &str) -> Result<EmailThread, ApiError> {
        let resp = self
            .loader
            .load_batched(ServiceKind::Email, "get_threads", thread_id)
            .await?;
        serde_json::from_value((*resp).clone())
            .map_err(|e| ApiError::Unknown(format!("malformed thread payload: {e}")))
    }
}

#[derive(Clone)]
pub struct CalendarService {
    loader: Arc<DataLoader>,
}

impl CalendarService {
    pub fn new(loader: Arc<DataLoader>) -> Self {
        Self { loader }
    }

    pub async fn search(
        &self,
        query: &str,
        max_results: u64,
    ) -> Result<SearchPage<CalendarEvent>, ApiError> {
        let resp = self
            .loader
            .load(
                ServiceKind::Calendar,
                "search",
                json!({"q": query, "max_results": max_results}),
            )
            .await?;
        parse_page(&resp)
    }
}

#[derive(Clone)]
pub struct ContactsService {
    loader: Arc<DataLoader>,
}

impl ContactsService {
    pub fn new(loader: Arc<DataLoader>) -> Self {
        Self { loader }
    }

    pub async fn search(
        &self,
        query: &str,
        max_results: u64,
    ) -> Result<SearchPage<Contact>, ApiError> {
        let resp = self
            .loader
            .load(
                ServiceKind::Contacts,
                "search",
                json!({"q": query, "max_results": max_results}),
            )
            .await?;
        parse_page(&resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_parse_tolerates_missing_fields() {
        let value = json!({
            "items": [{
                "id": "m1",
                "thread_id": "t1",
                "from": {"email": "a@b.com"},
                "subject": "hi",
                "ts": "2026-05-01T12:00:00Z"
            }]
        });
        let page: SearchPage<EmailHandle> = parse_page(&value).unwrap();
        assert_eq!(page.items.len(), 1);
        assert!(!page.truncated);
        assert!(!page.items[0].unread);
        assert!(page.items[0].labels.is_empty());
    }

    #[test]
    fn page_parse_rejects_malformed_items() {
        let value = json!({"items": [{"id": 42}]});
        let err = parse_page::<EmailHandle>(&value).unwrap_err();
        assert!(matches!(err, ApiError::Unknown(_)));
    }

    #[test]
    fn address_domain() {
        let addr = Address {
            name: None,
            email: "jess@acme.com".to_string(),
        };
        assert_eq!(addr.domain(), "acme.com");
    }
}
