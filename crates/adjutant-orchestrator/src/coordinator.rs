//! L2 — topologically schedule and run a validated plan.
//!
//! Nodes in a layer launch concurrently under a global cap and per-service
//! caps; each node runs under its own timeout and the request deadline's
//! cancellation token. Node failures are classified: optional nodes fail
//! soft, required nodes fail the request unless the plan is best-effort.
//! Results live in a BTreeMap so two runs of the same plan on the same
//! inputs hand the synthesizer identical bytes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use adjutant_core::config::{
    CALENDAR_CONCURRENCY, CONTACTS_CONCURRENCY, EMAIL_CONCURRENCY, LLM_CONCURRENCY,
};
use adjutant_core::trace::{ExecutionTrace, NodeState};
use adjutant_core::types::ServiceKind;
use adjutant_plan::{EdgeRef, Plan, PlanNode, StrategyRegistry, StrategySpec};
use adjutant_strategies::{
    NodeError, NodeOutput, RequestContext, ResolvedParams, Strategy,
};

use crate::progress::ProgressEvent;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("reauthorization required for {provider}: {reason}")]
    NeedsReauth { provider: String, reason: String },

    #[error("{service} unavailable, retry after {retry_after_ms}ms")]
    ServiceUnavailable { service: String, retry_after_ms: u64 },

    #[error("deadline exceeded after {ms}ms")]
    DeadlineExceeded { ms: u64 },

    #[error("node {node} failed: {error}")]
    NodeFailed { node: String, error: NodeError },

    #[error("internal scheduling error: {0}")]
    Internal(String),
}

pub struct ExecOutcome {
    pub results: BTreeMap<String, NodeOutput>,
    pub warnings: Vec<String>,
    /// Set when a soft-failed branch needed reauthorization; the envelope
    /// must carry it even though the request as a whole succeeded.
    pub needs_reauth: Option<(String, String)>,
}

pub struct ExecutionCoordinator {
    strategies: BTreeMap<&'static str, Arc<dyn Strategy>>,
    registry: Arc<StrategyRegistry>,
    global: Arc<Semaphore>,
    per_service: BTreeMap<ServiceKind, Arc<Semaphore>>,
    node_timeout: Duration,
}

impl ExecutionCoordinator {
    pub fn new(
        strategies: BTreeMap<&'static str, Arc<dyn Strategy>>,
        registry: Arc<StrategyRegistry>,
        global_concurrency: usize,
        node_timeout: Duration,
    ) -> Self {
        let per_service = [
            (ServiceKind::Email, EMAIL_CONCURRENCY),
            (ServiceKind::Calendar, CALENDAR_CONCURRENCY),
            (ServiceKind::Contacts, CONTACTS_CONCURRENCY),
            (ServiceKind::Llm, LLM_CONCURRENCY),
        ]
        .into_iter()
        .map(|(k, n)| (k, Arc::new(Semaphore::new(n))))
        .collect();
        Self {
            strategies,
            registry,
            global: Arc::new(Semaphore::new(global_concurrency)),
            per_service,
            node_timeout,
        }
    }

    pub async fn run(
        &self,
        plan: &Plan,
        ctx: Arc<RequestContext>,
        trace: Arc<Mutex<ExecutionTrace>>,
        progress: Option<mpsc::Sender<ProgressEvent>>,
    ) -> Result<ExecOutcome, ExecError> {
        // A clarification node short-circuits everything else: no provider
        // calls beyond the ambiguity probe.
        if plan.contains_strategy("needs_user_input") {
            return self.run_clarification(plan, ctx, trace, progress).await;
        }

        let layers = plan
            .topo_layers()
            .map_err(|e| ExecError::Internal(e.to_string()))?;
        let deps = plan.dependencies();
        let mut edges_in: BTreeMap<String, Vec<EdgeRef>> = BTreeMap::new();
        for edge in plan.edges() {
            edges_in.entry(edge.to_node.clone()).or_default().push(edge);
        }

        let mut results: BTreeMap<String, NodeOutput> = BTreeMap::new();
        let mut dead: BTreeSet<String> = BTreeSet::new();
        let mut warnings: Vec<String> = Vec::new();
        let mut needs_reauth: Option<(String, String)> = None;

        for layer in layers {
            if ctx.cancel.is_cancelled() {
                return self.on_cancelled(plan, &trace, results, warnings, needs_reauth);
            }

            let mut handles = Vec::new();
            for id in &layer {
                let node = plan
                    .node(id)
                    .ok_or_else(|| ExecError::Internal(format!("node {id} vanished")))?;

                if deps
                    .get(id)
                    .map(|d| d.iter().any(|up| dead.contains(up)))
                    .unwrap_or(false)
                {
                    trace
                        .lock()
                        .unwrap()
                        .finish(id, NodeState::Skipped, 0, None);
                    emit(&progress, ProgressEvent::NodeFinished {
                        id: id.clone(),
                        state: "skipped".to_string(),
                        timing_ms: 0,
                    })
                    .await;
                    dead.insert(id.clone());
                    continue;
                }

                let strategy = match self.strategies.get(node.strategy.as_str()) {
                    Some(s) => Arc::clone(s),
                    None => {
                        handles.push((
                            id.clone(),
                            Err(NodeError::BadInput(format!(
                                "strategy {:?} is not registered",
                                node.strategy
                            ))),
                        ));
                        continue;
                    }
                };
                let params = match self.resolve_params(node, edges_in.get(id), &results) {
                    Ok(p) => p,
                    Err(e) => {
                        handles.push((id.clone(), Err(e)));
                        continue;
                    }
                };
                let handle = self.spawn_node(node, strategy, params, &ctx, &trace, &progress);
                handles.push((id.clone(), Ok(handle)));
            }

            // Await in layer order; merge order is defined by node id.
            for (id, handle) in handles {
                let (result, elapsed_ms) = match handle {
                    Ok(handle) => handle
                        .await
                        .unwrap_or((Err(NodeError::Cancelled), 0)),
                    Err(e) => (Err(e), 0),
                };
                match result {
                    Ok(mut output) => {
                        output.timing_ms = elapsed_ms;
                        warnings.extend(output.warnings.iter().cloned());
                        trace
                            .lock()
                            .unwrap()
                            .finish(&id, NodeState::Succeeded, elapsed_ms, None);
                        emit(&progress, ProgressEvent::NodeFinished {
                            id: id.clone(),
                            state: "succeeded".to_string(),
                            timing_ms: elapsed_ms,
                        })
                        .await;
                        results.insert(id, output);
                    }
                    Err(error) => {
                        let state = if error == NodeError::Cancelled {
                            NodeState::Cancelled
                        } else {
                            NodeState::Failed
                        };
                        trace.lock().unwrap().finish(
                            &id,
                            state,
                            elapsed_ms,
                            Some(error.to_string()),
                        );
                        emit(&progress, ProgressEvent::NodeFinished {
                            id: id.clone(),
                            state: state.as_str().to_string(),
                            timing_ms: elapsed_ms,
                        })
                        .await;

                        let node = plan.node(&id);
                        let optional = node.map(PlanNode::is_optional).unwrap_or(false);
                        if optional || plan.best_effort {
                            warn!(node = %id, error = %error, "node failed soft, descendants skip");
                            if let NodeError::NeedsReauth { provider, reason } = &error {
                                needs_reauth
                                    .get_or_insert_with(|| (provider.clone(), reason.clone()));
                            }
                            warnings.push(format!("{id}: {error}"));
                            dead.insert(id);
                        } else {
                            ctx.cancel.cancel();
                            mark_unfinished_cancelled(&trace);
                            return Err(hard_failure(&id, error));
                        }
                    }
                }
            }
        }

        if ctx.cancel.is_cancelled() {
            return self.on_cancelled(plan, &trace, results, warnings, needs_reauth);
        }
        Ok(ExecOutcome {
            results,
            warnings,
            needs_reauth,
        })
    }

    async fn run_clarification(
        &self,
        plan: &Plan,
        ctx: Arc<RequestContext>,
        trace: Arc<Mutex<ExecutionTrace>>,
        progress: Option<mpsc::Sender<ProgressEvent>>,
    ) -> Result<ExecOutcome, ExecError> {
        let Some(node) = plan.nodes.iter().find(|n| n.strategy == "needs_user_input") else {
            return Err(ExecError::Internal("clarification node vanished".to_string()));
        };
        let strategy = self
            .strategies
            .get("needs_user_input")
            .ok_or_else(|| ExecError::Internal("needs_user_input unregistered".to_string()))?;

        {
            let mut t = trace.lock().unwrap();
            t.mark_running(&node.id);
        }
        let params = ResolvedParams {
            node_id: node.id.clone(),
            raw: node.params.clone(),
            inputs: BTreeMap::new(),
        };
        let started = Instant::now();
        let output = strategy
            .execute(&ctx, &params)
            .await
            .map_err(|e| hard_failure(&node.id, e))?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let mut results = BTreeMap::new();
        {
            let mut t = trace.lock().unwrap();
            t.finish(&node.id, NodeState::Succeeded, elapsed_ms, None);
            for other in &plan.nodes {
                if other.id != node.id {
                    t.finish(&other.id, NodeState::Skipped, 0, None);
                }
            }
        }
        emit(&progress, ProgressEvent::NodeFinished {
            id: node.id.clone(),
            state: "succeeded".to_string(),
            timing_ms: elapsed_ms,
        })
        .await;
        debug!(node = %node.id, "plan short-circuited for clarification");
        results.insert(node.id.clone(), output);
        Ok(ExecOutcome {
            results,
            warnings: Vec::new(),
            needs_reauth: None,
        })
    }

    fn resolve_params(
        &self,
        node: &PlanNode,
        edges: Option<&Vec<EdgeRef>>,
        results: &BTreeMap<String, NodeOutput>,
    ) -> Result<ResolvedParams, NodeError> {
        let mut inputs = BTreeMap::new();
        if let Some(edges) = edges {
            for edge in edges {
                let upstream = results.get(&edge.from_node).ok_or_else(|| {
                    NodeError::BadInput(format!("upstream {} has no result", edge.from_node))
                })?;
                let value = upstream.value.read_field(&edge.from_field).ok_or_else(|| {
                    NodeError::BadInput(format!(
                        "upstream {} has no field {}",
                        edge.from_node, edge.from_field
                    ))
                })?;
                inputs.insert(edge.to_param.clone(), value);
            }
        }
        Ok(ResolvedParams {
            node_id: node.id.clone(),
            raw: node.params.clone(),
            inputs,
        })
    }

    fn spawn_node(
        &self,
        node: &PlanNode,
        strategy: Arc<dyn Strategy>,
        params: ResolvedParams,
        ctx: &Arc<RequestContext>,
        trace: &Arc<Mutex<ExecutionTrace>>,
        progress: &Option<mpsc::Sender<ProgressEvent>>,
    ) -> tokio::task::JoinHandle<(Result<NodeOutput, NodeError>, u64)> {
        let spec = self.registry.get(&node.strategy);
        let remaining = ctx.deadline.saturating_duration_since(Instant::now());
        let timeout = spec
            .and_then(|s| s.node_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(self.node_timeout)
            .min(remaining.max(Duration::from_millis(1)));

        let services = node_services(node, spec);
        let service_sems: Vec<Arc<Semaphore>> = services
            .iter()
            .filter_map(|s| self.per_service.get(s).cloned())
            .collect();

        let id = node.id.clone();
        let global = Arc::clone(&self.global);
        let ctx = Arc::clone(ctx);
        let trace = Arc::clone(trace);
        let progress = progress.clone();

        tokio::spawn(async move {
            let Ok(_global) = global.acquire_owned().await else {
                return (Err(NodeError::Cancelled), 0);
            };
            let mut service_permits = Vec::with_capacity(service_sems.len());
            for sem in service_sems {
                match sem.acquire_owned().await {
                    Ok(permit) => service_permits.push(permit),
                    Err(_) => return (Err(NodeError::Cancelled), 0),
                }
            }
            if ctx.cancel.is_cancelled() {
                return (Err(NodeError::Cancelled), 0);
            }

            trace.lock().unwrap().mark_running(&id);
            emit(&progress, ProgressEvent::NodeStarted { id: id.clone() }).await;

            let cancel = ctx.cancel.clone();
            let started = Instant::now();
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(NodeError::Cancelled),
                outcome = tokio::time::timeout(timeout, strategy.execute(&ctx, &params)) => {
                    outcome.unwrap_or(Err(NodeError::Timeout {
                        ms: timeout.as_millis() as u64,
                    }))
                }
            };
            (result, started.elapsed().as_millis() as u64)
        })
    }

    fn on_cancelled(
        &self,
        plan: &Plan,
        trace: &Arc<Mutex<ExecutionTrace>>,
        results: BTreeMap<String, NodeOutput>,
        mut warnings: Vec<String>,
        needs_reauth: Option<(String, String)>,
    ) -> Result<ExecOutcome, ExecError> {
        mark_unfinished_cancelled(trace);
        if plan.best_effort {
            warnings.push("request deadline reached; results are partial".to_string());
            Ok(ExecOutcome {
                results,
                warnings,
                needs_reauth,
            })
        } else {
            Err(ExecError::DeadlineExceeded { ms: 0 })
        }
    }
}

/// Service domains a node will call into, from its spec plus the `domain`
/// param of the retrieval strategies. Sorted so permit acquisition order
/// is fixed.
fn node_services(node: &PlanNode, spec: Option<&StrategySpec>) -> Vec<ServiceKind> {
    let mut services: BTreeSet<ServiceKind> = spec
        .map(|s| s.providers.iter().copied().collect())
        .unwrap_or_default();
    if let Some(domain) = node.params.get("domain").and_then(serde_json::Value::as_str) {
        match domain {
            "email" => {
                services.insert(ServiceKind::Email);
            }
            "calendar" => {
                services.insert(ServiceKind::Calendar);
            }
            "contacts" => {
                services.insert(ServiceKind::Contacts);
            }
            _ => {}
        }
    }
    services.into_iter().collect()
}

fn mark_unfinished_cancelled(trace: &Arc<Mutex<ExecutionTrace>>) {
    let mut t = trace.lock().unwrap();
    let unfinished: Vec<String> = t
        .nodes
        .iter()
        .filter(|(_, n)| !n.state.is_terminal())
        .map(|(id, _)| id.clone())
        .collect();
    for id in unfinished {
        t.finish(&id, NodeState::Cancelled, 0, None);
    }
}

fn hard_failure(node: &str, error: NodeError) -> ExecError {
    match error {
        NodeError::NeedsReauth { provider, reason } => ExecError::NeedsReauth { provider, reason },
        NodeError::ServiceUnavailable {
            service,
            retry_after_ms,
        } => ExecError::ServiceUnavailable {
            service,
            retry_after_ms,
        },
        NodeError::Cancelled => ExecError::DeadlineExceeded { ms: 0 },
        NodeError::Timeout { ms } => ExecError::DeadlineExceeded { ms },
        other => ExecError::NodeFailed {
            node: node.to_string(),
            error: other,
        },
    }
}

async fn emit(progress: &Option<mpsc::Sender<ProgressEvent>>, event: ProgressEvent) {
    if let Some(tx) = progress {
        let _ = tx.send(event).await;
    }
}
