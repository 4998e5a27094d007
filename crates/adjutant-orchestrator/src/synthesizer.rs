//! L3 — compose the user-visible reply from typed node outputs.
//!
//! Shape selection is mechanical; item ordering is fully deterministic
//! before any model sees the data. Ask-back and empty-state replies are
//! template-rendered without an LLM call. The synthesizer never re-fetches
//! anything.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use adjutant_core::types::{Citation, Preferences, Tone, Verbosity};
use adjutant_plan::Plan;
use adjutant_providers::llm::{LlmClient, LlmRequest};
use adjutant_strategies::{NodeOutput, NodeValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseShape {
    List,
    Summary,
    AskBack,
    /// Reserved for action-confirming strategies; the read-only catalog
    /// never selects it.
    Confirmation,
    EmptyState,
}

/// Everything the synthesizer works from, presentation-ordered. Serialized
/// form is the determinism contract: fixed plan + fixed provider responses
/// must yield byte-equal inputs.
#[derive(Debug, Clone, Serialize)]
pub struct SynthesisInput {
    pub query: String,
    pub shape: ResponseShape,
    pub primary_node: Option<String>,
    pub primary: Option<NodeValue>,
    pub warnings: Vec<String>,
    pub verbosity: Verbosity,
    pub tone: Tone,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisOutput {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub follow_ups: Vec<String>,
}

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("LLM call failed: {0}")]
    Llm(String),
}

pub struct Synthesizer {
    llm: Arc<dyn LlmClient>,
}

impl Synthesizer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Deterministically assemble the synthesis input from the result map.
    pub fn build_input(
        query: &str,
        plan: &Plan,
        results: &BTreeMap<String, NodeOutput>,
        preferences: &Preferences,
        warnings: &[String],
    ) -> SynthesisInput {
        let clarification = results
            .iter()
            .find(|(_, out)| matches!(out.value, NodeValue::Clarification(_)));
        if let Some((id, out)) = clarification {
            return SynthesisInput {
                query: query.to_string(),
                shape: ResponseShape::AskBack,
                primary_node: Some(id.clone()),
                primary: Some(out.value.clone()),
                warnings: warnings.to_vec(),
                verbosity: preferences.verbosity,
                tone: preferences.tone,
            };
        }

        let mut terminals = plan.terminal_nodes();
        terminals.sort();
        let primary_node = terminals
            .iter()
            .find(|id| results.get(*id).map(|o| !o.value.is_empty()).unwrap_or(false))
            .or_else(|| terminals.iter().find(|id| results.contains_key(*id)))
            .cloned();
        let primary = primary_node
            .as_ref()
            .and_then(|id| results.get(id))
            .map(|out| presentation_order(out.value.clone()));

        let shape = match &primary {
            None => ResponseShape::EmptyState,
            Some(value) if value.is_empty() => ResponseShape::EmptyState,
            Some(NodeValue::Threads(_)) | Some(NodeValue::Verdicts(_)) => ResponseShape::Summary,
            Some(_) => ResponseShape::List,
        };

        SynthesisInput {
            query: query.to_string(),
            shape,
            primary_node,
            primary,
            warnings: warnings.to_vec(),
            verbosity: preferences.verbosity,
            tone: preferences.tone,
        }
    }

    pub async fn synthesize(
        &self,
        input: &SynthesisInput,
    ) -> Result<SynthesisOutput, SynthesisError> {
        match input.shape {
            ResponseShape::AskBack => Ok(render_ask_back(input)),
            ResponseShape::EmptyState => Ok(render_empty_state(input)),
            _ => self.render_with_llm(input).await,
        }
    }

    async fn render_with_llm(
        &self,
        input: &SynthesisInput,
    ) -> Result<SynthesisOutput, SynthesisError> {
        let citations = citations_for(input);
        let digest = digest(input);
        let verbosity = match input.verbosity {
            Verbosity::Short => "one or two sentences",
            Verbosity::Normal => "a short paragraph plus a compact list",
            Verbosity::Verbose => "a thorough rundown of every item",
        };
        let tone = match input.tone {
            Tone::Neutral => "plainly",
            Tone::Friendly => "warmly",
            Tone::Formal => "formally",
        };
        let system = format!(
            "You are a personal assistant answering from retrieved mailbox \
             and calendar data. Answer {tone} in {verbosity}. Use ONLY the \
             items given; never invent senders, dates, or counts."
        );
        let prompt = format!(
            "Question: {}\n\nRetrieved data:\n{digest}\n{}",
            input.query,
            if input.warnings.is_empty() {
                String::new()
            } else {
                format!("\nCaveats to mention: {}\n", input.warnings.join("; "))
            }
        );

        debug!(shape = ?input.shape, "synthesizing answer");
        let response = self
            .llm
            .complete(&LlmRequest::single(&system, &prompt))
            .await
            .map_err(|e| SynthesisError::Llm(e.to_string()))?;

        Ok(SynthesisOutput {
            answer: response.content,
            citations,
            follow_ups: Vec::new(),
        })
    }
}

fn render_ask_back(input: &SynthesisInput) -> SynthesisOutput {
    let (reason, candidates) = match &input.primary {
        Some(NodeValue::Clarification(c)) => (c.reason.clone(), c.candidates.clone()),
        _ => ("I need more detail to answer that".to_string(), Vec::new()),
    };
    let mut answer = format!("Quick check before I dig in — {reason}.");
    if !candidates.is_empty() {
        answer.push_str(&format!(" Did you mean: {}?", candidates.join(", ")));
    }
    SynthesisOutput {
        answer,
        citations: Vec::new(),
        follow_ups: candidates,
    }
}

fn render_empty_state(input: &SynthesisInput) -> SynthesisOutput {
    let mut answer = format!(
        "I looked, but nothing in your data matches \"{}\" right now.",
        input.query
    );
    if !input.warnings.is_empty() {
        answer.push_str(&format!(" (Note: {}.)", input.warnings.join("; ")));
    }
    SynthesisOutput {
        answer,
        citations: Vec::new(),
        follow_ups: Vec::new(),
    }
}

fn item_cap(verbosity: Verbosity) -> usize {
    match verbosity {
        Verbosity::Short => 3,
        Verbosity::Normal => 10,
        Verbosity::Verbose => usize::MAX,
    }
}

fn citations_for(input: &SynthesisInput) -> Vec<Citation> {
    let node_id = match &input.primary_node {
        Some(id) => id.clone(),
        None => return Vec::new(),
    };
    let value = match &input.primary {
        Some(value) => value,
        None => return Vec::new(),
    };
    value
        .item_ids()
        .into_iter()
        .take(item_cap(input.verbosity))
        .map(|item_id| Citation {
            node_id: node_id.clone(),
            item_id,
        })
        .collect()
}

/// Final presentation ordering: stable sort on (score desc, timestamp
/// desc, id asc) or the closest equivalent per payload kind.
fn presentation_order(value: NodeValue) -> NodeValue {
    match value {
        NodeValue::Scored(mut items) => {
            items.sort_by(|a, b| {
                b.score
                    .cmp(&a.score)
                    .then(b.handle.ts.cmp(&a.handle.ts))
                    .then(a.handle.id.cmp(&b.handle.id))
            });
            NodeValue::Scored(items)
        }
        NodeValue::Actions(mut items) => {
            items.sort_by(|a, b| {
                b.confidence
                    .cmp(&a.confidence)
                    .then(b.handle.ts.cmp(&a.handle.ts))
                    .then(a.handle.id.cmp(&b.handle.id))
            });
            NodeValue::Actions(items)
        }
        NodeValue::Senders(mut items) => {
            items.sort_by(|a, b| {
                b.vip_score
                    .cmp(&a.vip_score)
                    .then(b.handle.ts.cmp(&a.handle.ts))
                    .then(a.handle.id.cmp(&b.handle.id))
            });
            NodeValue::Senders(items)
        }
        NodeValue::Emails(mut items) => {
            items.sort_by(|a, b| b.ts.cmp(&a.ts).then(a.id.cmp(&b.id)));
            NodeValue::Emails(items)
        }
        NodeValue::Events(mut items) => {
            items.sort_by(|a, b| a.start.cmp(&b.start).then(a.id.cmp(&b.id)));
            NodeValue::Events(items)
        }
        NodeValue::Pairs(mut items) => {
            items.sort_by(|a, b| {
                b.email
                    .ts
                    .cmp(&a.email.ts)
                    .then(a.email.id.cmp(&b.email.id))
            });
            NodeValue::Pairs(items)
        }
        other => other,
    }
}

fn digest(input: &SynthesisInput) -> String {
    let value = match &input.primary {
        Some(value) => value,
        None => return "(no items)".to_string(),
    };
    let cap = item_cap(input.verbosity);
    let mut lines = Vec::new();
    match value {
        NodeValue::Scored(items) => {
            for item in items.iter().take(cap) {
                lines.push(format!(
                    "- [urgency {} {:?}] {:?} from {} at {}",
                    item.score,
                    item.band,
                    item.handle.subject,
                    item.handle.from.email,
                    item.handle.ts.to_rfc3339()
                ));
            }
        }
        NodeValue::Actions(items) => {
            for item in items.iter().take(cap) {
                lines.push(format!(
                    "- [{:?} {}%] {:?} from {} at {}",
                    item.action,
                    item.confidence,
                    item.handle.subject,
                    item.handle.from.email,
                    item.handle.ts.to_rfc3339()
                ));
            }
        }
        NodeValue::Senders(items) => {
            for item in items.iter().take(cap) {
                lines.push(format!(
                    "- [{}] {:?} from {} at {}",
                    item.sender_type.as_str(),
                    item.handle.subject,
                    item.handle.from.email,
                    item.handle.ts.to_rfc3339()
                ));
            }
        }
        NodeValue::Emails(items) => {
            for item in items.iter().take(cap) {
                lines.push(format!(
                    "- {:?} from {} at {}",
                    item.subject,
                    item.from.email,
                    item.ts.to_rfc3339()
                ));
            }
        }
        NodeValue::Events(items) => {
            for item in items.iter().take(cap) {
                lines.push(format!(
                    "- {:?} {} -> {}",
                    item.title,
                    item.start.to_rfc3339(),
                    item.end.to_rfc3339()
                ));
            }
        }
        NodeValue::Threads(items) => {
            for item in items.iter().take(cap) {
                lines.push(format!(
                    "- thread {:?} ({} messages)",
                    item.subject,
                    item.messages.len()
                ));
                for msg in &item.messages {
                    lines.push(format!("    {}: {}", msg.from.email, msg.body));
                }
            }
        }
        NodeValue::Pairs(items) => {
            for item in items.iter().take(cap) {
                lines.push(format!(
                    "- email {:?} matches event {:?} (key {})",
                    item.email.subject, item.event.title, item.key
                ));
            }
        }
        NodeValue::Verdicts(items) => {
            for item in items.iter().take(cap) {
                lines.push(format!(
                    "- {} relevant={} {}",
                    item.item_id, item.relevant, item.note
                ));
            }
        }
        NodeValue::Contacts(items) => {
            for item in items.iter().take(cap) {
                lines.push(format!("- {} <{}>", item.name, item.email));
            }
        }
        NodeValue::Clarification(_) => {}
    }
    if value.len() > cap {
        lines.push(format!("... and {} more", value.len() - cap));
    }
    lines.join("\n")
}
