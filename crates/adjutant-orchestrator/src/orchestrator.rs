//! Top-level glue: fetch user context, truncate history, decompose,
//! validate (revising once on feedback), execute under the request
//! deadline, synthesize, and assemble the reply envelope. One execution
//! trace and one structured timing record per request.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use adjutant_core::config::{
    AdjutantConfig, CONTEXT_CACHE_TTL_SECS, MAX_REQUEST_DEADLINE_MS,
};
use adjutant_core::error::AdjutantError;
use adjutant_core::trace::ExecutionTrace;
use adjutant_core::types::{
    ChatRequest, ChatTurn, ContextOut, ConversationHistory, EnvelopeTrace, NodeTiming,
    PlanEnvelope, ReauthRequired, Role, UserContext,
};
use adjutant_plan::{validate, Plan, StrategyRegistry};
use adjutant_providers::llm::LlmClient;
use adjutant_providers::loader::DataLoader;
use adjutant_providers::ApiClient;
use adjutant_strategies::{builtin_strategies, RequestContext};

use crate::coordinator::{ExecError, ExecutionCoordinator};
use crate::decomposer::Decomposer;
use crate::progress::ProgressEvent;
use crate::synthesizer::Synthesizer;

/// Where user contexts come from (profile service, settings store). An
/// external collaborator; only the interface lives here.
#[async_trait]
pub trait UserContextSource: Send + Sync {
    async fn fetch(&self, user_id: &str) -> Result<UserContext, AdjutantError>;
}

pub struct Orchestrator {
    config: AdjutantConfig,
    registry: Arc<StrategyRegistry>,
    decomposer: Decomposer,
    coordinator: ExecutionCoordinator,
    synthesizer: Synthesizer,
    api: Arc<ApiClient>,
    llm: Arc<dyn LlmClient>,
    context_source: Arc<dyn UserContextSource>,
    context_cache: DashMap<String, (Instant, UserContext)>,
}

impl Orchestrator {
    pub fn new(
        config: AdjutantConfig,
        api: Arc<ApiClient>,
        llm: Arc<dyn LlmClient>,
        context_source: Arc<dyn UserContextSource>,
    ) -> Self {
        let registry = Arc::new(StrategyRegistry::builtin());
        Self {
            decomposer: Decomposer::new(Arc::clone(&llm), Arc::clone(&registry)),
            coordinator: ExecutionCoordinator::new(
                builtin_strategies(),
                Arc::clone(&registry),
                config.limits.global_concurrency,
                Duration::from_millis(config.limits.node_timeout_ms),
            ),
            synthesizer: Synthesizer::new(Arc::clone(&llm)),
            registry,
            config,
            api,
            llm,
            context_source,
            context_cache: DashMap::new(),
        }
    }

    pub async fn handle(&self, request: ChatRequest) -> PlanEnvelope {
        self.handle_with_progress(request, None).await
    }

    pub async fn handle_with_progress(
        &self,
        request: ChatRequest,
        progress: Option<mpsc::Sender<ProgressEvent>>,
    ) -> PlanEnvelope {
        let request_id = uuid::Uuid::new_v4().to_string();
        let history = request.history.truncated();

        let user = match self.user_context(&request.user_id).await {
            Ok(user) => user,
            Err(e) => {
                error!(request_id = %request_id, error = %e, "user context fetch failed");
                return failure_envelope(
                    "Something went wrong looking up your account — please try again.",
                    e.code(),
                    &history,
                    &request.message,
                );
            }
        };
        let mut preferences = user.preferences.clone();
        if let Some(verbosity) = request.options.verbosity {
            preferences.verbosity = verbosity;
        }

        // L1 with a single validator-driven revision.
        let decompose_started = Instant::now();
        let plan = match self.plan_for(&request, &history, &user).await {
            Ok(plan) => plan,
            Err(envelope) => return *envelope,
        };
        let decompose_ms = decompose_started.elapsed().as_millis() as u64;

        let mut plan = plan;
        if let Some(best_effort) = request.options.best_effort {
            plan.best_effort = best_effort;
        }
        let deadline_ms = request
            .options
            .deadline_ms
            .or(plan.deadline_ms)
            .unwrap_or(self.config.limits.request_deadline_ms)
            .min(MAX_REQUEST_DEADLINE_MS);

        // L2 under the request deadline.
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        let watchdog = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(deadline_ms)).await;
                cancel.cancel();
            })
        };

        let loader = Arc::new(DataLoader::new(
            Arc::clone(&self.api),
            &user.user_id,
            user.enrolled.clone(),
        ));
        let ctx = Arc::new(RequestContext::new(
            user,
            loader,
            Arc::clone(&self.llm),
            cancel.clone(),
            deadline,
        ));
        let trace = Arc::new(Mutex::new(ExecutionTrace::new(
            &request_id,
            plan.nodes.iter().map(|n| n.id.clone()),
        )));

        let execute_started = Instant::now();
        let outcome = self
            .coordinator
            .run(&plan, Arc::clone(&ctx), Arc::clone(&trace), progress)
            .await;
        let execute_ms = execute_started.elapsed().as_millis() as u64;
        watchdog.abort();

        let envelope = match outcome {
            Ok(outcome) => {
                let synthesize_started = Instant::now();
                let input = Synthesizer::build_input(
                    &request.message,
                    &plan,
                    &outcome.results,
                    &preferences,
                    &outcome.warnings,
                );
                match self.synthesizer.synthesize(&input).await {
                    Ok(synthesis) => {
                        let synthesize_ms = synthesize_started.elapsed().as_millis() as u64;
                        info!(
                            request_id = %request_id,
                            decompose_ms,
                            execute_ms,
                            synthesize_ms,
                            nodes = plan.nodes.len(),
                            "request completed"
                        );
                        PlanEnvelope {
                            context_out: context_out(
                                &history,
                                &request.message,
                                Some(&synthesis.answer),
                            ),
                            answer: synthesis.answer,
                            citations: synthesis.citations,
                            warnings: outcome.warnings,
                            needs_reauth: outcome.needs_reauth.map(|(provider, reason)| {
                                ReauthRequired { provider, reason }
                            }),
                            trace: None,
                            error_code: None,
                        }
                    }
                    Err(e) => {
                        error!(request_id = %request_id, error = %e, "synthesis failed");
                        failure_envelope(
                            "I gathered the data but couldn't compose an answer — please try again.",
                            "LLM_PROVIDER_ERROR",
                            &history,
                            &request.message,
                        )
                    }
                }
            }
            Err(err) => self.error_envelope(&request_id, err, &history, &request.message),
        };

        {
            let mut t = trace.lock().unwrap();
            t.record_component("decompose", decompose_ms);
            t.record_component("execute", execute_ms);
        }
        match request.options.trace {
            true => with_trace(envelope, &plan, &trace),
            false => envelope,
        }
    }

    /// Cache-aside user context with a short TTL.
    async fn user_context(&self, user_id: &str) -> Result<UserContext, AdjutantError> {
        if let Some(entry) = self.context_cache.get(user_id) {
            let (fetched_at, user) = entry.value();
            if fetched_at.elapsed() < Duration::from_secs(CONTEXT_CACHE_TTL_SECS) {
                debug!(user_id, "user context cache hit");
                return Ok(user.clone());
            }
        }
        info!(user_id, "user context cache miss");
        let user = self.context_source.fetch(user_id).await?;
        self.context_cache
            .insert(user_id.to_string(), (Instant::now(), user.clone()));
        Ok(user)
    }

    async fn plan_for(
        &self,
        request: &ChatRequest,
        history: &ConversationHistory,
        user: &UserContext,
    ) -> Result<Plan, Box<PlanEnvelope>> {
        let reject = |message: &str| {
            Box::new(failure_envelope(
                message,
                "PLAN_REJECTED",
                history,
                &request.message,
            ))
        };

        let first = self
            .decomposer
            .decompose(&request.message, history, user, None)
            .await
            .map_err(|e| {
                warn!(error = %e, "decomposition failed");
                reject("I couldn't plan that request — can you rephrase?")
            })?;

        let max_nodes = self.config.limits.max_plan_nodes;
        let violations = match validate(&first, &self.registry, user, max_nodes) {
            Ok(()) => return Ok(first),
            Err(violations) => violations,
        };
        debug!(count = violations.len(), "plan rejected, revising once");

        let revised = self
            .decomposer
            .decompose(&request.message, history, user, Some(&violations))
            .await
            .map_err(|_| reject("I couldn't plan that request — can you rephrase?"))?;
        match validate(&revised, &self.registry, user, max_nodes) {
            Ok(()) => Ok(revised),
            Err(violations) => {
                warn!(count = violations.len(), "revised plan still invalid");
                Err(reject("I couldn't plan that request — can you rephrase?"))
            }
        }
    }

    fn error_envelope(
        &self,
        request_id: &str,
        err: ExecError,
        history: &ConversationHistory,
        message: &str,
    ) -> PlanEnvelope {
        match err {
            ExecError::NeedsReauth { provider, reason } => {
                let mut envelope = failure_envelope(
                    &format!(
                        "I can't reach your {provider} account anymore — please reconnect it and try again."
                    ),
                    "NEEDS_REAUTH",
                    history,
                    message,
                );
                envelope.needs_reauth = Some(ReauthRequired { provider, reason });
                envelope
            }
            ExecError::ServiceUnavailable {
                service,
                retry_after_ms,
            } => {
                let mut envelope = failure_envelope(
                    &format!("The {service} service is having trouble right now — please try again shortly."),
                    "SERVICE_UNAVAILABLE",
                    history,
                    message,
                );
                envelope
                    .warnings
                    .push(format!("{service} unavailable, retry after {retry_after_ms}ms"));
                envelope
            }
            ExecError::DeadlineExceeded { .. } => failure_envelope(
                "That took longer than I allow — try narrowing the question or asking again.",
                "DEADLINE_EXCEEDED",
                history,
                message,
            ),
            ExecError::NodeFailed { ref node, ref error } => {
                error!(request_id, node = %node, error = %error, "node failed");
                failure_envelope(
                    "Something went wrong while gathering your data — please try again.",
                    "PROVIDER_ERROR",
                    history,
                    message,
                )
            }
            ExecError::Internal(ref detail) => {
                error!(request_id, detail = %detail, "internal scheduling error");
                failure_envelope(
                    "Something went wrong on my side — please try again.",
                    "INTERNAL_ERROR",
                    history,
                    message,
                )
            }
        }
    }
}

fn context_out(
    history: &ConversationHistory,
    user_message: &str,
    answer: Option<&str>,
) -> ContextOut {
    let mut turns = history.0.clone();
    let now = chrono::Utc::now();
    turns.push(ChatTurn {
        role: Role::User,
        content: user_message.to_string(),
        ts: now,
    });
    if let Some(answer) = answer {
        turns.push(ChatTurn {
            role: Role::Assistant,
            content: answer.to_string(),
            ts: now,
        });
    }
    ContextOut {
        history: ConversationHistory(turns),
    }
}

fn failure_envelope(
    answer: &str,
    code: &str,
    history: &ConversationHistory,
    user_message: &str,
) -> PlanEnvelope {
    PlanEnvelope {
        answer: answer.to_string(),
        citations: Vec::new(),
        context_out: context_out(history, user_message, Some(answer)),
        warnings: Vec::new(),
        needs_reauth: None,
        trace: None,
        error_code: Some(code.to_string()),
    }
}

fn with_trace(
    mut envelope: PlanEnvelope,
    plan: &Plan,
    trace: &Arc<Mutex<ExecutionTrace>>,
) -> PlanEnvelope {
    let t = trace.lock().unwrap();
    envelope.trace = Some(EnvelopeTrace {
        plan: serde_json::to_value(plan).unwrap_or_default(),
        nodes: t
            .nodes
            .values()
            .map(|n| NodeTiming {
                id: n.id.clone(),
                state: n.state.as_str().to_string(),
                timing_ms: n.timing_ms,
            })
            .collect(),
    });
    envelope
}
