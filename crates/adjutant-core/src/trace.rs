//! Per-request execution trace. Mirrors the plan 1:1; every node failure
//! must land here — nothing is swallowed silently.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Node lifecycle states. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeState::Pending | NodeState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Pending => "pending",
            NodeState::Running => "running",
            NodeState::Succeeded => "succeeded",
            NodeState::Failed => "failed",
            NodeState::Cancelled => "cancelled",
            NodeState::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeTrace {
    pub id: String,
    pub state: NodeState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub timing_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeTrace {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: NodeState::Pending,
            started_at: None,
            ended_at: None,
            attempts: 0,
            timing_ms: 0,
            error: None,
        }
    }
}

/// One trace per request, keyed by node id (BTreeMap: stable iteration).
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionTrace {
    pub request_id: String,
    pub nodes: BTreeMap<String, NodeTrace>,
    /// Per-component wall time, recorded by the orchestrator.
    pub component_ms: BTreeMap<String, u64>,
}

impl ExecutionTrace {
    pub fn new(request_id: &str, node_ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            request_id: request_id.to_string(),
            nodes: node_ids
                .into_iter()
                .map(|id| (id.clone(), NodeTrace::new(&id)))
                .collect(),
            component_ms: BTreeMap::new(),
        }
    }

    pub fn mark_running(&mut self, id: &str) {
        if let Some(n) = self.nodes.get_mut(id) {
            if n.state.is_terminal() {
                return;
            }
            n.state = NodeState::Running;
            n.started_at = Some(Utc::now());
            n.attempts += 1;
        }
    }

    /// Move a node to a terminal state. Once terminal, further transitions
    /// are ignored.
    pub fn finish(&mut self, id: &str, state: NodeState, timing_ms: u64, error: Option<String>) {
        debug_assert!(state.is_terminal());
        if let Some(n) = self.nodes.get_mut(id) {
            if n.state.is_terminal() {
                return;
            }
            n.state = state;
            n.ended_at = Some(Utc::now());
            n.timing_ms = timing_ms;
            n.error = error;
        }
    }

    pub fn state_of(&self, id: &str) -> Option<NodeState> {
        self.nodes.get(id).map(|n| n.state)
    }

    pub fn record_component(&mut self, component: &str, ms: u64) {
        self.component_ms.insert(component.to_string(), ms);
    }

    /// True when every node has reached a terminal state.
    pub fn all_terminal(&self) -> bool {
        self.nodes.values().all(|n| n.state.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_final() {
        let mut trace = ExecutionTrace::new("req-1", vec!["n1".to_string()]);
        trace.mark_running("n1");
        trace.finish("n1", NodeState::Cancelled, 12, None);
        trace.finish("n1", NodeState::Succeeded, 99, None);
        let n = &trace.nodes["n1"];
        assert_eq!(n.state, NodeState::Cancelled);
        assert_eq!(n.timing_ms, 12);
    }

    #[test]
    fn all_terminal_reflects_pending_nodes() {
        let mut trace =
            ExecutionTrace::new("req-1", vec!["n1".to_string(), "n2".to_string()]);
        trace.finish("n1", NodeState::Succeeded, 5, None);
        assert!(!trace.all_terminal());
        trace.finish("n2", NodeState::Skipped, 0, None);
        assert!(trace.all_terminal());
    }
}
