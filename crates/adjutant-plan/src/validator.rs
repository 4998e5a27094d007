//! Pre-execution plan validation. A plan that fails here never runs.
//! All violations are collected in one pass so the decomposer gets
//! complete feedback for its single revision attempt.

use serde::Serialize;
use serde_json::Value;

use adjutant_core::types::{ServiceKind, UserContext};

use crate::filters::{parse_filter, FilterError};
use crate::graph::{parse_reference, reference_candidates, Plan, PlanGraphError, PlanNode};
use crate::registry::{ParamKind, StrategyRegistry, StrategySpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCode {
    UnknownStrategy,
    DuplicateNodeId,
    UnknownNode,
    UnknownField,
    Cycle,
    TooManyNodes,
    ForbiddenFilter,
    BadFilter,
    MissingParam,
    BadParam,
    BadMaxResults,
    NotEnrolled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanViolation {
    pub code: ViolationCode,
    pub node: Option<String>,
    pub message: String,
}

impl PlanViolation {
    fn new(code: ViolationCode, node: Option<&str>, message: String) -> Self {
        Self {
            code,
            node: node.map(str::to_string),
            message,
        }
    }
}

impl std::fmt::Display for PlanViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.node {
            Some(node) => write!(f, "[{node}] {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Validate a decomposed plan against the registry and the user's enrolled
/// providers. Returns every violation found, not just the first.
pub fn validate(
    plan: &Plan,
    registry: &StrategyRegistry,
    user: &UserContext,
    max_nodes: usize,
) -> Result<(), Vec<PlanViolation>> {
    let mut violations = Vec::new();

    if plan.nodes.is_empty() {
        violations.push(PlanViolation::new(
            ViolationCode::MissingParam,
            None,
            "plan has no nodes".to_string(),
        ));
    }
    if plan.nodes.len() > max_nodes {
        violations.push(PlanViolation::new(
            ViolationCode::TooManyNodes,
            None,
            format!("plan has {} nodes, max {max_nodes}", plan.nodes.len()),
        ));
    }

    match plan.topo_layers() {
        Ok(_) => {}
        Err(PlanGraphError::Cycle(node)) => violations.push(PlanViolation::new(
            ViolationCode::Cycle,
            Some(&node),
            format!("node {node} participates in a cycle"),
        )),
        Err(PlanGraphError::DuplicateNode(node)) => violations.push(PlanViolation::new(
            ViolationCode::DuplicateNodeId,
            Some(&node),
            format!("node id {node} is declared more than once"),
        )),
    }

    for node in &plan.nodes {
        let spec = match registry.get(&node.strategy) {
            Some(spec) => spec,
            None => {
                violations.push(PlanViolation::new(
                    ViolationCode::UnknownStrategy,
                    Some(&node.id),
                    format!("unknown strategy {:?}", node.strategy),
                ));
                continue;
            }
        };
        check_params(plan, node, spec, registry, &mut violations);
        check_enrollment(node, spec, user, &mut violations);
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

fn check_params(
    plan: &Plan,
    node: &PlanNode,
    spec: &StrategySpec,
    registry: &StrategyRegistry,
    violations: &mut Vec<PlanViolation>,
) {
    for param in &spec.params {
        if param.required && !node.params.contains_key(param.name) {
            violations.push(PlanViolation::new(
                ViolationCode::MissingParam,
                Some(&node.id),
                format!("{} requires param {:?}", spec.id, param.name),
            ));
        }
    }

    for (name, value) in &node.params {
        // `optional` marks any node non-critical; it is not strategy-specific.
        if name == "optional" {
            if !value.is_boolean() {
                violations.push(PlanViolation::new(
                    ViolationCode::BadParam,
                    Some(&node.id),
                    "optional must be a boolean".to_string(),
                ));
            }
            continue;
        }
        let param = match spec.param(name) {
            Some(p) => p,
            None => {
                violations.push(PlanViolation::new(
                    ViolationCode::BadParam,
                    Some(&node.id),
                    format!("{} does not accept param {:?}", spec.id, name),
                ));
                continue;
            }
        };

        match &param.kind {
            ParamKind::Str => {
                if !value.is_string() {
                    bad_kind(violations, node, name, "a string");
                }
            }
            ParamKind::Int => {
                if !value.is_u64() {
                    bad_kind(violations, node, name, "a non-negative integer");
                }
            }
            ParamKind::Bool => {
                if !value.is_boolean() {
                    bad_kind(violations, node, name, "a boolean");
                }
            }
            ParamKind::StrList => {
                let ok = value
                    .as_array()
                    .map(|a| a.iter().all(Value::is_string))
                    .unwrap_or(false);
                if !ok {
                    bad_kind(violations, node, name, "a list of strings");
                }
            }
            ParamKind::Choice(allowed) => match value.as_str() {
                Some(s) if allowed.contains(&s) => {}
                _ => violations.push(PlanViolation::new(
                    ViolationCode::BadParam,
                    Some(&node.id),
                    format!("{name} must be one of {allowed:?}"),
                )),
            },
            ParamKind::Reference => {
                check_reference_param(plan, node, name, value, registry, violations);
            }
        }

        // Strings that look like references to real nodes become edges no
        // matter the declared kind; their fields must exist.
        if !matches!(param.kind, ParamKind::Reference) {
            for candidate in reference_candidates(value) {
                check_edge_target(plan, node, candidate, registry, violations);
            }
        }
    }

    if spec.id == "metadata_filter" {
        check_metadata_filter(node, violations);
    }
}

fn bad_kind(violations: &mut Vec<PlanViolation>, node: &PlanNode, name: &str, expected: &str) {
    violations.push(PlanViolation::new(
        ViolationCode::BadParam,
        Some(&node.id),
        format!("{name} must be {expected}"),
    ));
}

fn check_reference_param(
    plan: &Plan,
    node: &PlanNode,
    name: &str,
    value: &Value,
    registry: &StrategyRegistry,
    violations: &mut Vec<PlanViolation>,
) {
    let candidates: Vec<&str> = match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };
    if candidates.is_empty() || !candidates.iter().all(|s| parse_reference(s).is_some()) {
        violations.push(PlanViolation::new(
            ViolationCode::BadParam,
            Some(&node.id),
            format!("{name} must be a node.field reference"),
        ));
        return;
    }
    for candidate in candidates {
        check_edge_target(plan, node, candidate, registry, violations);
    }
}

fn check_edge_target(
    plan: &Plan,
    node: &PlanNode,
    reference: &str,
    registry: &StrategyRegistry,
    violations: &mut Vec<PlanViolation>,
) {
    let (head, field) = match parse_reference(reference) {
        Some(parts) => parts,
        None => return,
    };
    let upstream = match plan.node(head) {
        Some(n) => n,
        None => {
            violations.push(PlanViolation::new(
                ViolationCode::UnknownNode,
                Some(&node.id),
                format!("reference {reference:?} points at unknown node {head:?}"),
            ));
            return;
        }
    };
    if let Some(spec) = registry.get(&upstream.strategy) {
        if spec.output_field(field).is_none() {
            violations.push(PlanViolation::new(
                ViolationCode::UnknownField,
                Some(&node.id),
                format!(
                    "{} does not declare output field {field:?} (reference {reference:?})",
                    upstream.strategy
                ),
            ));
        }
    }
}

fn check_metadata_filter(node: &PlanNode, violations: &mut Vec<PlanViolation>) {
    if let Some(filters) = node.params.get("filters").and_then(Value::as_array) {
        for token in filters.iter().filter_map(Value::as_str) {
            match parse_filter(token) {
                Ok(_) => {}
                Err(FilterError::ForbiddenSynonym(t)) => violations.push(PlanViolation::new(
                    ViolationCode::ForbiddenFilter,
                    Some(&node.id),
                    format!("{t:?} is not a provider filter — use the matching detector strategy"),
                )),
                Err(e) => violations.push(PlanViolation::new(
                    ViolationCode::BadFilter,
                    Some(&node.id),
                    e.to_string(),
                )),
            }
        }
    }
    if let Some(value) = node.params.get("max_results") {
        match value.as_u64() {
            Some(n) if (1..=adjutant_core::config::MAX_RESULTS_CAP).contains(&n) => {}
            _ => violations.push(PlanViolation::new(
                ViolationCode::BadMaxResults,
                Some(&node.id),
                format!(
                    "max_results must be between 1 and {}",
                    adjutant_core::config::MAX_RESULTS_CAP
                ),
            )),
        }
    }
}

fn check_enrollment(
    node: &PlanNode,
    spec: &StrategySpec,
    user: &UserContext,
    violations: &mut Vec<PlanViolation>,
) {
    let mut needed: Vec<ServiceKind> = spec
        .providers
        .iter()
        .copied()
        .filter(|s| *s != ServiceKind::Llm)
        .collect();
    if let Some(domain) = node.params.get("domain").and_then(Value::as_str) {
        match domain {
            "email" => needed.push(ServiceKind::Email),
            "calendar" => needed.push(ServiceKind::Calendar),
            "contacts" => needed.push(ServiceKind::Contacts),
            _ => {}
        }
    }
    for service in needed {
        if user.provider_for(service).is_none() {
            violations.push(PlanViolation::new(
                ViolationCode::NotEnrolled,
                Some(&node.id),
                format!(
                    "user has no {service} provider enrolled — connect one before asking about {service}"
                ),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn user_with_email() -> UserContext {
        UserContext {
            user_id: "u1".to_string(),
            enrolled: BTreeMap::from([(ServiceKind::Email, "google".to_string())]),
            timezone: "UTC".to_string(),
            locale: "en-US".to_string(),
            preferences: Default::default(),
            vip: vec![],
            org_domain: "acme.com".to_string(),
        }
    }

    fn plan(json: &str) -> Plan {
        Plan::from_json(json).unwrap()
    }

    fn codes(result: Result<(), Vec<PlanViolation>>) -> Vec<ViolationCode> {
        result.unwrap_err().into_iter().map(|v| v.code).collect()
    }

    #[test]
    fn valid_two_stage_plan_passes() {
        let p = plan(
            r#"{"nodes":[
              {"id":"n1","type":"metadata_filter","params":{"domain":"email","filters":["is:unread","newer_than:7d"],"max_results":50}},
              {"id":"n2","type":"urgency_detector","params":{"input_email_ids":["n1.items"],"threshold":"medium"}}
            ]}"#,
        );
        let registry = StrategyRegistry::builtin();
        assert!(validate(&p, &registry, &user_with_email(), 16).is_ok());
    }

    #[test]
    fn forbidden_filter_is_rejected() {
        let p = plan(
            r#"{"nodes":[{"id":"n1","type":"metadata_filter","params":{"domain":"email","filters":["isUrgent"],"max_results":10}}]}"#,
        );
        let registry = StrategyRegistry::builtin();
        let got = codes(validate(&p, &registry, &user_with_email(), 16));
        assert!(got.contains(&ViolationCode::ForbiddenFilter));
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        let p = plan(r#"{"nodes":[{"id":"n1","type":"fetch_everything","params":{}}]}"#);
        let registry = StrategyRegistry::builtin();
        let got = codes(validate(&p, &registry, &user_with_email(), 16));
        assert_eq!(got, vec![ViolationCode::UnknownStrategy]);
    }

    #[test]
    fn edge_to_missing_node_is_rejected() {
        let p = plan(
            r#"{"nodes":[{"id":"n2","type":"urgency_detector","params":{"input_email_ids":"n1.items"}}]}"#,
        );
        let registry = StrategyRegistry::builtin();
        let got = codes(validate(&p, &registry, &user_with_email(), 16));
        assert!(got.contains(&ViolationCode::UnknownNode));
    }

    #[test]
    fn edge_to_undeclared_field_is_rejected() {
        let p = plan(
            r#"{"nodes":[
              {"id":"n1","type":"metadata_filter","params":{"domain":"email","filters":["is:unread"],"max_results":10}},
              {"id":"n2","type":"urgency_detector","params":{"input_email_ids":"n1.scores"}}
            ]}"#,
        );
        let registry = StrategyRegistry::builtin();
        let got = codes(validate(&p, &registry, &user_with_email(), 16));
        assert!(got.contains(&ViolationCode::UnknownField));
    }

    #[test]
    fn zero_max_results_is_rejected() {
        let p = plan(
            r#"{"nodes":[{"id":"n1","type":"metadata_filter","params":{"domain":"email","filters":["is:unread"],"max_results":0}}]}"#,
        );
        let registry = StrategyRegistry::builtin();
        let got = codes(validate(&p, &registry, &user_with_email(), 16));
        assert!(got.contains(&ViolationCode::BadMaxResults));
    }

    #[test]
    fn calendar_plan_without_calendar_provider_is_rejected() {
        let p = plan(
            r#"{"nodes":[{"id":"n1","type":"metadata_filter","params":{"domain":"calendar","filters":["newer_than:7d"],"max_results":10}}]}"#,
        );
        let registry = StrategyRegistry::builtin();
        let got = codes(validate(&p, &registry, &user_with_email(), 16));
        assert!(got.contains(&ViolationCode::NotEnrolled));
    }

    #[test]
    fn cyclic_plan_is_rejected() {
        let p = plan(
            r#"{"nodes":[
              {"id":"a","type":"cross_reference","params":{"left":"b.pairs","right":"b.pairs","join_key":"subject"}},
              {"id":"b","type":"cross_reference","params":{"left":"a.pairs","right":"a.pairs","join_key":"subject"}}
            ]}"#,
        );
        let registry = StrategyRegistry::builtin();
        let got = codes(validate(&p, &registry, &user_with_email(), 16));
        assert!(got.contains(&ViolationCode::Cycle));
    }

    #[test]
    fn oversized_plan_is_rejected() {
        let nodes: Vec<String> = (0..20)
            .map(|i| {
                format!(
                    r#"{{"id":"n{i}","type":"metadata_filter","params":{{"domain":"email","filters":["is:unread"],"max_results":5}}}}"#
                )
            })
            .collect();
        let p = plan(&format!(r#"{{"nodes":[{}]}}"#, nodes.join(",")));
        let registry = StrategyRegistry::builtin();
        let got = codes(validate(&p, &registry, &user_with_email(), 16));
        assert!(got.contains(&ViolationCode::TooManyNodes));
    }

    #[test]
    fn unknown_param_is_rejected() {
        let p = plan(
            r#"{"nodes":[{"id":"n1","type":"metadata_filter","params":{"domain":"email","filters":["is:unread"],"max_results":5,"sort_by":"urgency"}}]}"#,
        );
        let registry = StrategyRegistry::builtin();
        let got = codes(validate(&p, &registry, &user_with_email(), 16));
        assert!(got.contains(&ViolationCode::BadParam));
    }

    #[test]
    fn optional_flag_is_accepted_on_any_node() {
        let p = plan(
            r#"{"nodes":[{"id":"n1","type":"metadata_filter","params":{"domain":"email","filters":["is:unread"],"max_results":5,"optional":true}}]}"#,
        );
        let registry = StrategyRegistry::builtin();
        assert!(validate(&p, &registry, &user_with_email(), 16).is_ok());
    }
}
