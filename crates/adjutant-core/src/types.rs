//! Request/response wire types and the per-request user context.
//!
//! Envelope fields use camelCase on the wire (`contextOut`, `needsReauth`);
//! plan JSON stays snake_case — see the plan crate for those types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{HISTORY_MAX_MESSAGES, HISTORY_MAX_TOKENS};

/// External service domain a strategy may depend on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Email,
    Calendar,
    Contacts,
    Llm,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Email => "email",
            ServiceKind::Calendar => "calendar",
            ServiceKind::Contacts => "contacts",
            ServiceKind::Llm => "llm",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// A single turn of client-owned conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
    pub ts: DateTime<Utc>,
}

/// Ordered client-supplied history. The server stores nothing between calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationHistory(pub Vec<ChatTurn>);

impl ConversationHistory {
    /// Rough token estimate: 4 bytes per token. Good enough for a bound.
    pub fn estimated_tokens(&self) -> usize {
        self.0.iter().map(|t| t.content.len() / 4 + 1).sum()
    }

    /// Truncate to the most recent `HISTORY_MAX_MESSAGES` messages or
    /// `HISTORY_MAX_TOKENS` estimated tokens, whichever is stricter.
    /// Newest turns are always kept.
    pub fn truncated(&self) -> ConversationHistory {
        let start = self.0.len().saturating_sub(HISTORY_MAX_MESSAGES);
        let mut kept: Vec<ChatTurn> = self.0[start..].to_vec();

        let mut budget = HISTORY_MAX_TOKENS;
        let mut cut = kept.len();
        for (i, turn) in kept.iter().enumerate().rev() {
            let cost = turn.content.len() / 4 + 1;
            if cost > budget {
                cut = i + 1;
                break;
            }
            budget -= cost;
            cut = i;
        }
        kept.drain(..cut);
        ConversationHistory(kept)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Short,
    #[default]
    Normal,
    Verbose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    #[default]
    Neutral,
    Friendly,
    Formal,
}

/// Presentation preferences carried in the user context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default)]
    pub verbosity: Verbosity,
    #[serde(default)]
    pub tone: Tone,
}

/// Immutable per-request user context. Built at request entry from a
/// short-TTL cache, discarded at response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    /// Enrolled service domains mapped to the provider serving them
    /// (e.g. email -> "google").
    pub enrolled: BTreeMap<ServiceKind, String>,
    pub timezone: String,
    pub locale: String,
    #[serde(default)]
    pub preferences: Preferences,
    /// VIP sender allowlist (email addresses).
    #[serde(default)]
    pub vip: Vec<String>,
    /// The user's organisation domain (e.g. "acme.com").
    #[serde(default)]
    pub org_domain: String,
}

impl UserContext {
    pub fn provider_for(&self, service: ServiceKind) -> Option<&str> {
        self.enrolled.get(&service).map(String::as_str)
    }
}

/// Per-request options from the transport layer.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatOptions {
    #[serde(default)]
    pub verbosity: Option<Verbosity>,
    #[serde(default)]
    pub best_effort: Option<bool>,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    /// Include the plan and node trace in the envelope.
    #[serde(default)]
    pub trace: bool,
}

/// Inbound chat request (`POST /chat/message` body).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub user_id: String,
    pub message: String,
    #[serde(default)]
    pub history: ConversationHistory,
    #[serde(default)]
    pub options: ChatOptions,
}

/// A citation linking an answer fragment back to a source item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub node_id: String,
    pub item_id: String,
}

/// Reauthorization requirement surfaced to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReauthRequired {
    pub provider: String,
    pub reason: String,
}

/// Per-node trace entry included in the envelope when tracing is on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTiming {
    pub id: String,
    pub state: String,
    pub timing_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeTrace {
    pub plan: serde_json::Value,
    pub nodes: Vec<NodeTiming>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextOut {
    pub history: ConversationHistory,
}

/// Final reply envelope returned to the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanEnvelope {
    pub answer: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub citations: Vec<Citation>,
    pub context_out: ContextOut,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub needs_reauth: Option<ReauthRequired>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub trace: Option<EnvelopeTrace>,
    /// Stable short code describing a failed request ("NEEDS_REAUTH", ...).
    /// Absent on success.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(content: &str) -> ChatTurn {
        ChatTurn {
            role: Role::User,
            content: content.to_string(),
            ts: DateTime::parse_from_rfc3339("2026-05-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn truncation_keeps_most_recent_messages() {
        let history = ConversationHistory((0..25).map(|i| turn(&format!("msg {i}"))).collect());
        let trimmed = history.truncated();
        assert_eq!(trimmed.len(), HISTORY_MAX_MESSAGES);
        assert_eq!(trimmed.0.last().unwrap().content, "msg 24");
        assert_eq!(trimmed.0[0].content, "msg 15");
    }

    #[test]
    fn truncation_applies_token_bound_when_stricter() {
        // 5 turns of ~2000 estimated tokens each; only the last two fit.
        let big = "x".repeat(8_000);
        let history = ConversationHistory((0..5).map(|_| turn(&big)).collect());
        let trimmed = history.truncated();
        assert_eq!(trimmed.len(), 2);
    }

    #[test]
    fn envelope_wire_field_names() {
        let env = PlanEnvelope {
            answer: "done".into(),
            citations: vec![Citation {
                node_id: "n1".into(),
                item_id: "m-1".into(),
            }],
            context_out: ContextOut {
                history: ConversationHistory::default(),
            },
            warnings: vec![],
            needs_reauth: Some(ReauthRequired {
                provider: "google".into(),
                reason: "scope".into(),
            }),
            trace: None,
            error_code: None,
        };
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains(r#""contextOut""#));
        assert!(json.contains(r#""needsReauth""#));
        assert!(json.contains(r#""nodeId":"n1""#));
        assert!(!json.contains(r#""trace""#));
    }
}
