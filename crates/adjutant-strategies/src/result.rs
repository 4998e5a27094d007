//! Typed node outputs. A node's declared output schema is the contract:
//! downstream nodes read declared fields through [`NodeValue::read_field`]
//! and nothing else.

use serde::{Deserialize, Serialize};

use adjutant_providers::services::{CalendarEvent, Contact, EmailHandle, EmailThread};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrgencyBand {
    Low,
    Medium,
    High,
}

impl UrgencyBand {
    pub fn from_score(score: u8) -> Option<Self> {
        match score {
            75..=u8::MAX => Some(UrgencyBand::High),
            50..=74 => Some(UrgencyBand::Medium),
            25..=49 => Some(UrgencyBand::Low),
            _ => None,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(UrgencyBand::Low),
            "medium" => Some(UrgencyBand::Medium),
            "high" => Some(UrgencyBand::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEmail {
    pub handle: EmailHandle,
    pub score: u8,
    pub band: Option<UrgencyBand>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    Investor,
    Customer,
    Peer,
    Boss,
    Report,
    Vendor,
    Unknown,
}

impl SenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderType::Investor => "investor",
            SenderType::Customer => "customer",
            SenderType::Peer => "peer",
            SenderType::Boss => "boss",
            SenderType::Report => "report",
            SenderType::Vendor => "vendor",
            SenderType::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedSender {
    pub handle: EmailHandle,
    pub sender_type: SenderType,
    /// 0-100; VIP allowlist members pin to 100.
    pub vip_score: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Reply,
    Review,
    Decide,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionItem {
    pub handle: EmailHandle,
    pub action: ActionType,
    /// 0-100.
    pub confidence: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinedPair {
    pub email: EmailHandle,
    pub event: CalendarEvent,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticVerdict {
    pub item_id: String,
    pub relevant: bool,
    #[serde(default)]
    pub note: String,
}

/// Request for user disambiguation; short-circuits execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clarification {
    pub reason: String,
    #[serde(default)]
    pub candidates: Vec<String>,
}

/// Union of typed strategy payloads, keyed by the strategy's declared
/// output schema. Externally tagged on the wire: `{"emails": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeValue {
    Emails(Vec<EmailHandle>),
    Events(Vec<CalendarEvent>),
    Contacts(Vec<Contact>),
    Threads(Vec<EmailThread>),
    Scored(Vec<ScoredEmail>),
    Senders(Vec<ClassifiedSender>),
    Actions(Vec<ActionItem>),
    Pairs(Vec<JoinedPair>),
    Verdicts(Vec<SemanticVerdict>),
    Clarification(Clarification),
}

impl NodeValue {
    /// Read a declared output field. The field names here mirror the
    /// registry's output schemas exactly.
    pub fn read_field(&self, field: &str) -> Option<NodeValue> {
        match (self, field) {
            (NodeValue::Emails(_), "items")
            | (NodeValue::Events(_), "items")
            | (NodeValue::Contacts(_), "items")
            | (NodeValue::Scored(_), "items")
            | (NodeValue::Senders(_), "items")
            | (NodeValue::Actions(_), "items")
            | (NodeValue::Verdicts(_), "items")
            | (NodeValue::Threads(_), "threads")
            | (NodeValue::Pairs(_), "pairs") => Some(self.clone()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            NodeValue::Emails(v) => v.len(),
            NodeValue::Events(v) => v.len(),
            NodeValue::Contacts(v) => v.len(),
            NodeValue::Threads(v) => v.len(),
            NodeValue::Scored(v) => v.len(),
            NodeValue::Senders(v) => v.len(),
            NodeValue::Actions(v) => v.len(),
            NodeValue::Pairs(v) => v.len(),
            NodeValue::Verdicts(v) => v.len(),
            NodeValue::Clarification(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Email handles behind this value, when the payload carries them.
    pub fn email_handles(&self) -> Option<Vec<EmailHandle>> {
        match self {
            NodeValue::Emails(v) => Some(v.clone()),
            NodeValue::Scored(v) => Some(v.iter().map(|s| s.handle.clone()).collect()),
            NodeValue::Senders(v) => Some(v.iter().map(|s| s.handle.clone()).collect()),
            NodeValue::Actions(v) => Some(v.iter().map(|a| a.handle.clone()).collect()),
            _ => None,
        }
    }

    /// Item ids for citations, in presentation order.
    pub fn item_ids(&self) -> Vec<String> {
        match self {
            NodeValue::Emails(v) => v.iter().map(|e| e.id.clone()).collect(),
            NodeValue::Events(v) => v.iter().map(|e| e.id.clone()).collect(),
            NodeValue::Contacts(v) => v.iter().map(|c| c.id.clone()).collect(),
            NodeValue::Threads(v) => v.iter().map(|t| t.id.clone()).collect(),
            NodeValue::Scored(v) => v.iter().map(|s| s.handle.id.clone()).collect(),
            NodeValue::Senders(v) => v.iter().map(|s| s.handle.id.clone()).collect(),
            NodeValue::Actions(v) => v.iter().map(|a| a.handle.id.clone()).collect(),
            NodeValue::Pairs(v) => v.iter().map(|p| p.email.id.clone()).collect(),
            NodeValue::Verdicts(v) => v.iter().map(|s| s.item_id.clone()).collect(),
            NodeValue::Clarification(_) => Vec::new(),
        }
    }
}

/// What the coordinator stores per succeeded node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeOutput {
    pub value: NodeValue,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub truncated: bool,
    pub timing_ms: u64,
}

impl NodeOutput {
    pub fn new(value: NodeValue) -> Self {
        Self {
            value,
            warnings: Vec::new(),
            truncated: false,
            timing_ms: 0,
        }
    }

    pub fn truncated(mut self, truncated: bool) -> Self {
        self.truncated = truncated;
        self
    }

    pub fn warn(mut self, message: impl Into<String>) -> Self {
        self.warnings.push(message.into());
        self
    }
}
