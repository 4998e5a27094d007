//! The finite, typed strategy vocabulary the decomposer may compose.
//! Built once at process start and immutable afterwards.

use std::collections::BTreeMap;

use serde::Serialize;

use adjutant_core::types::ServiceKind;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Str,
    Int,
    Bool,
    StrList,
    /// Must be a `<nodeId>.<field>` reference (or a list of them).
    Reference,
    Choice(&'static [&'static str]),
}

#[derive(Debug, Clone, Serialize)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
}

impl ParamSpec {
    fn required(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    fn optional(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputField {
    pub name: &'static str,
    /// Declared payload type, e.g. "EmailList" or "EmailScoreList".
    pub ty: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CostClass {
    Cheap,
    Medium,
    Llm,
}

/// Static metadata for one strategy.
#[derive(Debug, Clone, Serialize)]
pub struct StrategySpec {
    pub id: &'static str,
    pub summary: &'static str,
    pub params: Vec<ParamSpec>,
    pub outputs: Vec<OutputField>,
    /// Service domains the strategy calls out to. For the domain-parametric
    /// retrieval strategies this is empty; the `domain` param decides.
    pub providers: Vec<ServiceKind>,
    pub cost: CostClass,
    pub side_effect_free: bool,
    /// Per-strategy node timeout override (ms).
    pub node_timeout_ms: Option<u64>,
}

impl StrategySpec {
    pub fn output_field(&self, name: &str) -> Option<&OutputField> {
        self.outputs.iter().find(|f| f.name == name)
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }
}

pub const SENDER_TYPES: &[&str] = &[
    "investor", "customer", "peer", "boss", "report", "vendor", "unknown",
];

pub const DOMAINS: &[&str] = &["email", "calendar", "contacts"];
pub const URGENCY_THRESHOLDS: &[&str] = &["low", "medium", "high"];
pub const JOIN_KEYS: &[&str] = &["sender_email", "attendee_email", "subject"];

/// Registry mapping strategy id to its spec.
pub struct StrategyRegistry {
    specs: BTreeMap<&'static str, StrategySpec>,
}

impl StrategyRegistry {
    pub fn builtin() -> Self {
        let specs = [
            StrategySpec {
                id: "metadata_filter",
                summary: "Provider-native search with whitelisted operators.",
                params: vec![
                    ParamSpec::required("domain", ParamKind::Choice(DOMAINS)),
                    ParamSpec::required("filters", ParamKind::StrList),
                    ParamSpec::required("max_results", ParamKind::Int),
                ],
                outputs: vec![OutputField {
                    name: "items",
                    ty: "HandleList",
                }],
                providers: vec![],
                cost: CostClass::Cheap,
                side_effect_free: true,
                node_timeout_ms: None,
            },
            StrategySpec {
                id: "keyword_search",
                summary: "Free-text ranked search over one domain.",
                params: vec![
                    ParamSpec::required("domain", ParamKind::Choice(DOMAINS)),
                    ParamSpec::required("query", ParamKind::Str),
                    ParamSpec::optional("max_results", ParamKind::Int),
                ],
                outputs: vec![OutputField {
                    name: "items",
                    ty: "HandleList",
                }],
                providers: vec![],
                cost: CostClass::Cheap,
                side_effect_free: true,
                node_timeout_ms: None,
            },
            StrategySpec {
                id: "batch_thread_read",
                summary: "Fetch full thread bodies for a list of emails.",
                params: vec![ParamSpec::required("input_email_ids", ParamKind::Reference)],
                outputs: vec![OutputField {
                    name: "threads",
                    ty: "ThreadList",
                }],
                providers: vec![ServiceKind::Email],
                cost: CostClass::Medium,
                side_effect_free: true,
                node_timeout_ms: Some(15_000),
            },
            StrategySpec {
                id: "cross_reference",
                summary: "Join two handle lists by a shared key.",
                params: vec![
                    ParamSpec::required("left", ParamKind::Reference),
                    ParamSpec::required("right", ParamKind::Reference),
                    ParamSpec::required("join_key", ParamKind::Choice(JOIN_KEYS)),
                ],
                outputs: vec![OutputField {
                    name: "pairs",
                    ty: "JoinedList",
                }],
                providers: vec![],
                cost: CostClass::Cheap,
                side_effect_free: true,
                node_timeout_ms: None,
            },
            StrategySpec {
                id: "urgency_detector",
                summary: "Score emails 0-100 for urgency from labels, wording, sender impact, and time pressure.",
                params: vec![
                    ParamSpec::required("input_email_ids", ParamKind::Reference),
                    ParamSpec::optional("threshold", ParamKind::Choice(URGENCY_THRESHOLDS)),
                ],
                outputs: vec![OutputField {
                    name: "items",
                    ty: "EmailScoreList",
                }],
                providers: vec![],
                cost: CostClass::Cheap,
                side_effect_free: true,
                node_timeout_ms: None,
            },
            StrategySpec {
                id: "sender_classifier",
                summary: "Classify senders (investor, customer, peer, boss, report, vendor).",
                params: vec![
                    ParamSpec::required("input_email_ids", ParamKind::Reference),
                    ParamSpec::optional("filter_type", ParamKind::Choice(SENDER_TYPES)),
                ],
                outputs: vec![OutputField {
                    name: "items",
                    ty: "SenderClassificationList",
                }],
                providers: vec![],
                cost: CostClass::Cheap,
                side_effect_free: true,
                node_timeout_ms: None,
            },
            StrategySpec {
                id: "action_detector",
                summary: "Detect whether messages need a reply, review, or decision.",
                params: vec![
                    ParamSpec::required("input_email_ids", ParamKind::Reference),
                    ParamSpec::optional("min_confidence", ParamKind::Int),
                ],
                outputs: vec![OutputField {
                    name: "items",
                    ty: "ActionList",
                }],
                providers: vec![],
                cost: CostClass::Cheap,
                side_effect_free: true,
                node_timeout_ms: None,
            },
            StrategySpec {
                id: "semantic_analysis",
                summary: "LLM evaluation over a small bounded subset. Use only when cheaper strategies cannot answer.",
                params: vec![
                    ParamSpec::required("input_items", ParamKind::Reference),
                    ParamSpec::required("question", ParamKind::Str),
                    ParamSpec::optional("max_items", ParamKind::Int),
                ],
                outputs: vec![OutputField {
                    name: "items",
                    ty: "VerdictList",
                }],
                providers: vec![ServiceKind::Llm],
                cost: CostClass::Llm,
                side_effect_free: true,
                node_timeout_ms: Some(20_000),
            },
            StrategySpec {
                id: "needs_user_input",
                summary: "Ask the user to disambiguate instead of guessing. Short-circuits execution.",
                params: vec![
                    ParamSpec::required("reason", ParamKind::Str),
                    ParamSpec::optional("candidates", ParamKind::StrList),
                ],
                outputs: vec![],
                providers: vec![],
                cost: CostClass::Cheap,
                side_effect_free: true,
                node_timeout_ms: None,
            },
        ]
        .into_iter()
        .map(|spec| (spec.id, spec))
        .collect();
        Self { specs }
    }

    pub fn get(&self, id: &str) -> Option<&StrategySpec> {
        self.specs.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.specs.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StrategySpec> {
        self.specs.values()
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.specs.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_contains_the_full_vocabulary() {
        let registry = StrategyRegistry::builtin();
        for id in [
            "metadata_filter",
            "keyword_search",
            "batch_thread_read",
            "cross_reference",
            "urgency_detector",
            "sender_classifier",
            "action_detector",
            "semantic_analysis",
            "needs_user_input",
        ] {
            assert!(registry.contains(id), "missing {id}");
        }
    }

    #[test]
    fn declared_outputs_are_addressable() {
        let registry = StrategyRegistry::builtin();
        let spec = registry.get("urgency_detector").unwrap();
        assert!(spec.output_field("items").is_some());
        assert!(spec.output_field("scores").is_none());
        assert_eq!(spec.output_field("items").unwrap().ty, "EmailScoreList");
    }

    #[test]
    fn every_strategy_is_side_effect_free() {
        let registry = StrategyRegistry::builtin();
        assert!(registry.iter().all(|s| s.side_effect_free));
    }
}
