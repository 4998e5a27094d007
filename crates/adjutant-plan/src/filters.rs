//! Whitelisted provider search operators for `metadata_filter` nodes.
//!
//! Anything semantic (urgency, needs-reply, due-today) is NOT a filter;
//! those names are blacklisted here and must be expressed through the
//! detector strategies instead.

use thiserror::Error;

/// Filter names the decomposer must never emit as provider operators.
pub const FORBIDDEN_SYNONYMS: &[&str] = &[
    "isUrgent",
    "isUnread",
    "requires_response",
    "due_today",
    "sender_type",
];

pub const ALLOWED_IS_VALUES: &[&str] = &["unread", "read", "important", "starred"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOp {
    From(String),
    To(String),
    Subject(String),
    HasAttachment,
    Is(String),
    Label(String),
    NewerThanDays(u32),
    OlderThanDays(u32),
}

impl FilterOp {
    /// Canonical provider-grammar rendering of this operator.
    pub fn render(&self) -> String {
        match self {
            FilterOp::From(v) => format!("from:{v}"),
            FilterOp::To(v) => format!("to:{v}"),
            FilterOp::Subject(v) => format!("subject:{v}"),
            FilterOp::HasAttachment => "has:attachment".to_string(),
            FilterOp::Is(v) => format!("is:{v}"),
            FilterOp::Label(v) => format!("label:{v}"),
            FilterOp::NewerThanDays(n) => format!("newer_than:{n}d"),
            FilterOp::OlderThanDays(n) => format!("older_than:{n}d"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FilterError {
    #[error("unknown filter operator in {0:?}")]
    UnknownOperator(String),

    #[error("forbidden filter synonym {0:?} — use the matching detector strategy")]
    ForbiddenSynonym(String),

    #[error("bad filter value in {0:?}")]
    BadValue(String),
}

/// Parse one whitelisted filter token (e.g. `"newer_than:7d"`).
pub fn parse_filter(token: &str) -> Result<FilterOp, FilterError> {
    let head = token.split(':').next().unwrap_or(token);
    if FORBIDDEN_SYNONYMS.contains(&head) || FORBIDDEN_SYNONYMS.contains(&token) {
        return Err(FilterError::ForbiddenSynonym(token.to_string()));
    }

    let (op, value) = match token.split_once(':') {
        Some(parts) => parts,
        None => return Err(FilterError::UnknownOperator(token.to_string())),
    };
    if value.is_empty() {
        return Err(FilterError::BadValue(token.to_string()));
    }

    match op {
        "from" => Ok(FilterOp::From(value.to_string())),
        "to" => Ok(FilterOp::To(value.to_string())),
        "subject" => Ok(FilterOp::Subject(value.to_string())),
        "has" => {
            if value == "attachment" {
                Ok(FilterOp::HasAttachment)
            } else {
                Err(FilterError::BadValue(token.to_string()))
            }
        }
        "is" => {
            if ALLOWED_IS_VALUES.contains(&value) {
                Ok(FilterOp::Is(value.to_string()))
            } else {
                Err(FilterError::BadValue(token.to_string()))
            }
        }
        "label" => Ok(FilterOp::Label(value.to_string())),
        "newer_than" | "older_than" => {
            let days = value
                .strip_suffix('d')
                .and_then(|d| d.parse::<u32>().ok())
                .filter(|d| *d > 0)
                .ok_or_else(|| FilterError::BadValue(token.to_string()))?;
            if op == "newer_than" {
                Ok(FilterOp::NewerThanDays(days))
            } else {
                Ok(FilterOp::OlderThanDays(days))
            }
        }
        _ => Err(FilterError::UnknownOperator(token.to_string())),
    }
}

/// Human-readable operator list for the decomposer vocabulary document.
pub fn grammar_summary() -> String {
    [
        "from:<addr|name>",
        "to:<addr|name>",
        "subject:<phrase>",
        "has:attachment",
        "is:{unread|read|important|starred}",
        "label:<name>",
        "newer_than:<N>d",
        "older_than:<N>d",
    ]
    .join(", ")
}
