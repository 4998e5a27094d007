//! Wire-form plan DAG. Edges are implicit: any string parameter of the
//! form `<nodeId>.<field>` whose head names another node is a typed edge
//! reading that node's output field. The graph is stored as plain arrays;
//! topological layers are computed once and reused.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: String,
    #[serde(rename = "type")]
    pub strategy: String,
    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
}

impl PlanNode {
    /// Whether this node is declared non-critical in its plan params.
    pub fn is_optional(&self) -> bool {
        self.params
            .get("optional")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub nodes: Vec<PlanNode>,
    #[serde(default)]
    pub best_effort: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

/// A resolved typed edge: `to_node.to_param` reads `from_node.from_field`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeRef {
    pub from_node: String,
    pub from_field: String,
    pub to_node: String,
    pub to_param: String,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlanGraphError {
    #[error("plan contains a cycle involving node {0}")]
    Cycle(String),

    #[error("duplicate node id {0}")]
    DuplicateNode(String),
}

/// Parse `"n1.items"` into `("n1", "items")`. Both halves must be
/// non-empty identifiers.
pub fn parse_reference(s: &str) -> Option<(&str, &str)> {
    let (head, field) = s.split_once('.')?;
    let ident = |t: &str| {
        !t.is_empty() && t.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    if ident(head) && ident(field) {
        Some((head, field))
    } else {
        None
    }
}

/// Reference-shaped strings in a param value (plain string or string array).
pub fn reference_candidates(value: &Value) -> Vec<&str> {
    match value {
        Value::String(s) if parse_reference(s).is_some() => vec![s.as_str()],
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .filter(|s| parse_reference(s).is_some())
            .collect(),
        _ => Vec::new(),
    }
}

impl Plan {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn node(&self, id: &str) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_ids(&self) -> BTreeSet<&str> {
        self.nodes.iter().map(|n| n.id.as_str()).collect()
    }

    /// All typed edges in the plan. Only references whose head names an
    /// existing node count; other reference-shaped strings are literals
    /// (the validator decides whether that is allowed per param kind).
    pub fn edges(&self) -> Vec<EdgeRef> {
        let ids = self.node_ids();
        let mut edges = Vec::new();
        for node in &self.nodes {
            for (param, value) in &node.params {
                for candidate in reference_candidates(value) {
                    let (head, field) = match parse_reference(candidate) {
                        Some(parts) => parts,
                        None => continue,
                    };
                    if ids.contains(head) {
                        edges.push(EdgeRef {
                            from_node: head.to_string(),
                            from_field: field.to_string(),
                            to_node: node.id.clone(),
                            to_param: param.clone(),
                        });
                    }
                }
            }
        }
        edges
    }

    /// Upstream node ids per node id.
    pub fn dependencies(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut deps: BTreeMap<String, BTreeSet<String>> = self
            .nodes
            .iter()
            .map(|n| (n.id.clone(), BTreeSet::new()))
            .collect();
        for edge in self.edges() {
            deps.entry(edge.to_node.clone())
                .or_default()
                .insert(edge.from_node.clone());
        }
        deps
    }

    /// Kahn's algorithm grouped into layers; node ids inside a layer are
    /// sorted so two runs of the same plan schedule identically.
    pub fn topo_layers(&self) -> Result<Vec<Vec<String>>, PlanGraphError> {
        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(PlanGraphError::DuplicateNode(node.id.clone()));
            }
        }

        let deps = self.dependencies();
        let mut remaining: BTreeMap<String, BTreeSet<String>> = deps;
        let mut layers = Vec::new();

        while !remaining.is_empty() {
            let mut ready: Vec<String> = remaining
                .iter()
                .filter(|(_, d)| d.is_empty())
                .map(|(id, _)| id.clone())
                .collect();
            if ready.is_empty() {
                // Everything left depends on something unfinished: a cycle.
                let stuck = remaining.keys().next().cloned().unwrap_or_default();
                return Err(PlanGraphError::Cycle(stuck));
            }
            ready.sort();
            for id in &ready {
                remaining.remove(id);
            }
            for deps in remaining.values_mut() {
                for id in &ready {
                    deps.remove(id);
                }
            }
            layers.push(ready);
        }
        Ok(layers)
    }

    /// Ids of nodes no other node reads from. These carry the primary
    /// output the synthesizer presents.
    pub fn terminal_nodes(&self) -> Vec<String> {
        let consumed: BTreeSet<String> =
            self.edges().into_iter().map(|e| e.from_node).collect();
        self.nodes
            .iter()
            .filter(|n| !consumed.contains(&n.id))
            .map(|n| n.id.clone())
            .collect()
    }

    pub fn contains_strategy(&self, strategy: &str) -> bool {
        self.nodes.iter().any(|n| n.strategy == strategy)
    }
}
