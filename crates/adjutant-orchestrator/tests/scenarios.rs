//! End-to-end scenarios against deterministic fakes: scripted LLM, canned
//! provider transport, in-memory token store. No network, no sleep-based
//! flakiness beyond the deadline test's generous bounds.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use adjutant_core::config::{AdjutantConfig, RetryConfig};
use adjutant_core::error::AdjutantError;
use adjutant_core::trace::ExecutionTrace;
use adjutant_core::types::{
    ChatOptions, ChatRequest, ConversationHistory, Preferences, ServiceKind, UserContext,
};
use adjutant_orchestrator::{ExecutionCoordinator, Orchestrator, Synthesizer, UserContextSource};
use adjutant_plan::{Plan, StrategyRegistry};
use adjutant_providers::breaker::BreakerRegistry;
use adjutant_providers::client::ProviderTransport;
use adjutant_providers::llm::{LlmClient, LlmError, LlmRequest, LlmResponse};
use adjutant_providers::loader::DataLoader;
use adjutant_providers::token::{
    AccessToken, AuthExchanger, InMemoryTokenStore, RefreshError, RefreshGrant, TokenProvider,
    TokenRecord, TokenStore,
};
use adjutant_providers::ApiClient;
use adjutant_strategies::{builtin_strategies, RequestContext};

// ── Fakes ────────────────────────────────────────────────────────────────

struct FixtureTransport {
    email_searches: AtomicUsize,
    calendar_searches: AtomicUsize,
    thread_gets: AtomicUsize,
    emails: Value,
    hang: bool,
}

impl FixtureTransport {
    fn new(emails: Value) -> Self {
        Self {
            email_searches: AtomicUsize::new(0),
            calendar_searches: AtomicUsize::new(0),
            thread_gets: AtomicUsize::new(0),
            emails,
            hang: false,
        }
    }

    fn hanging(emails: Value) -> Self {
        Self {
            hang: true,
            ..Self::new(emails)
        }
    }
}

#[async_trait]
impl ProviderTransport for FixtureTransport {
    async fn invoke(
        &self,
        service: ServiceKind,
        method: &str,
        params: &Value,
        _token: &AccessToken,
    ) -> Result<Value, adjutant_providers::ApiError> {
        if self.hang {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        match (service, method) {
            (ServiceKind::Email, "search") => {
                self.email_searches.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"items": self.emails.clone()}))
            }
            (ServiceKind::Email, "get_threads") => {
                self.thread_gets.fetch_add(1, Ordering::SeqCst);
                let ids = params["ids"].as_array().cloned().unwrap_or_default();
                let items: serde_json::Map<String, Value> = ids
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|id| {
                        (
                            id.to_string(),
                            json!({"id": id, "subject": "thread", "messages": []}),
                        )
                    })
                    .collect();
                Ok(json!({"items": items}))
            }
            (ServiceKind::Calendar, "search") => {
                self.calendar_searches.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"items": []}))
            }
            _ => Ok(json!({"items": []})),
        }
    }
}

/// Plans pop off the front on each decompose call; synthesis replies are a
/// fixed deterministic string.
struct ScriptedLlm {
    plans: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    fn new(plans: &[&str]) -> Self {
        Self {
            plans: Mutex::new(plans.iter().rev().map(|s| s.to_string()).collect()),
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, req: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let content = if req.system.starts_with("You decompose") {
            let mut plans = self.plans.lock().unwrap();
            match plans.len() {
                0 => "{}".to_string(),
                1 => plans[0].clone(),
                _ => plans.pop().unwrap(),
            }
        } else {
            "Here is what I found in your mailbox.".to_string()
        };
        Ok(LlmResponse {
            content,
            model: "scripted".to_string(),
            tokens_in: 0,
            tokens_out: 0,
        })
    }
}

struct FixedContextSource(UserContext);

#[async_trait]
impl UserContextSource for FixedContextSource {
    async fn fetch(&self, _user_id: &str) -> Result<UserContext, AdjutantError> {
        Ok(self.0.clone())
    }
}

struct NeverExchange;

#[async_trait]
impl AuthExchanger for NeverExchange {
    async fn exchange(
        &self,
        _provider: &str,
        _refresh_token: &str,
    ) -> Result<RefreshGrant, RefreshError> {
        Err(RefreshError::Transient("not under test".to_string()))
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────

fn mailbox() -> Value {
    json!([
        {
            "id": "m-urgent",
            "thread_id": "t-urgent",
            "from": {"email": "ceo@acme.com"},
            "to": [{"email": "me@acme.com"}],
            "subject": "URGENT: board deck",
            "snippet": "need this asap today, please respond",
            "labels": ["important"],
            "unread": true,
            "important": true,
            "ts": "2026-07-30T09:00:00Z"
        },
        {
            "id": "m-reply",
            "thread_id": "t-reply",
            "from": {"email": "jo@acme.com"},
            "to": [{"email": "me@acme.com"}],
            "subject": "Offsite date",
            "snippet": "Can you make the 14th? Let me know",
            "unread": true,
            "ts": "2026-07-29T15:00:00Z"
        },
        {
            "id": "m-investor",
            "thread_id": "t-investor",
            "from": {"email": "alex@sequoiacapital.com"},
            "to": [{"email": "me@acme.com"}],
            "subject": "Q3 check-in",
            "snippet": "following up on the round",
            "unread": false,
            "ts": "2026-07-20T10:00:00Z"
        },
        {
            "id": "m-news",
            "thread_id": "t-news",
            "from": {"email": "digest@news.example"},
            "to": [],
            "subject": "Weekly digest",
            "snippet": "top stories for you",
            "unread": true,
            "ts": "2026-07-28T07:00:00Z"
        }
    ])
}

fn user(with_calendar: bool) -> UserContext {
    let mut enrolled = BTreeMap::from([(ServiceKind::Email, "google".to_string())]);
    if with_calendar {
        enrolled.insert(ServiceKind::Calendar, "google".to_string());
    }
    UserContext {
        user_id: "u1".to_string(),
        enrolled,
        timezone: "UTC".to_string(),
        locale: "en-US".to_string(),
        preferences: Preferences::default(),
        vip: vec!["ceo@acme.com".to_string()],
        org_domain: "acme.com".to_string(),
    }
}

async fn seeded_tokens(scopes: &[&str]) -> Arc<TokenProvider> {
    let store = Arc::new(InMemoryTokenStore::new());
    store
        .save(
            "u1",
            "google",
            &TokenRecord {
                access: "tok".to_string(),
                refresh: "ref".to_string(),
                expires_at: chrono::Utc::now().timestamp() + 3600,
                scope: scopes.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
                updated_at: 0,
                revoked: false,
            },
        )
        .await
        .unwrap();
    Arc::new(TokenProvider::new(store, Arc::new(NeverExchange)))
}

fn fast_config() -> AdjutantConfig {
    let mut config = AdjutantConfig::default();
    config.retry = RetryConfig {
        max_attempts: 1,
        base_delay_ms: 1,
        max_delay_ms: 1,
        jitter: false,
    };
    config
}

struct Harness {
    orchestrator: Orchestrator,
    transport: Arc<FixtureTransport>,
    api: Arc<ApiClient>,
}

async fn harness(
    transport: FixtureTransport,
    plans: &[&str],
    user_ctx: UserContext,
    scopes: &[&str],
) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let transport = Arc::new(transport);
    let tokens = seeded_tokens(scopes).await;
    let api = Arc::new(ApiClient::new(
        Arc::clone(&transport) as Arc<dyn ProviderTransport>,
        tokens,
        Arc::new(BreakerRegistry::default()),
        fast_config().retry,
    ));
    let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlm::new(plans));
    let orchestrator = Orchestrator::new(
        fast_config(),
        Arc::clone(&api),
        llm,
        Arc::new(FixedContextSource(user_ctx)),
    );
    Harness {
        orchestrator,
        transport,
        api,
    }
}

fn request(message: &str) -> ChatRequest {
    ChatRequest {
        user_id: "u1".to_string(),
        message: message.to_string(),
        history: ConversationHistory::default(),
        options: ChatOptions {
            trace: true,
            ..ChatOptions::default()
        },
    }
}

const URGENT_PLAN: &str = r#"{"nodes":[
  {"id":"n1","type":"metadata_filter","params":{"domain":"email","filters":["is:unread","newer_than:7d"],"max_results":50}},
  {"id":"n2","type":"urgency_detector","params":{"input_email_ids":["n1.items"],"threshold":"medium"}}
]}"#;

// ── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_unread_urgent_last_week() {
    let h = harness(
        FixtureTransport::new(mailbox()),
        &[URGENT_PLAN],
        user(false),
        &["mail.read"],
    )
    .await;
    let envelope = h
        .orchestrator
        .handle(request("Show me urgent unread emails from this week"))
        .await;

    assert_eq!(envelope.error_code, None);
    assert_eq!(envelope.answer, "Here is what I found in your mailbox.");
    let cited: Vec<&str> = envelope.citations.iter().map(|c| c.item_id.as_str()).collect();
    assert!(cited.contains(&"m-urgent"));
    assert!(!cited.contains(&"m-news"), "newsletter is below medium urgency");
    assert!(envelope.citations.iter().all(|c| c.node_id == "n2"));

    let trace = envelope.trace.expect("trace requested");
    assert!(trace.nodes.iter().all(|n| n.state == "succeeded"));
    assert_eq!(h.transport.email_searches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn scenario_investor_mail_last_month() {
    let plan = r#"{"nodes":[
      {"id":"n1","type":"metadata_filter","params":{"domain":"email","filters":["newer_than:30d"],"max_results":100}},
      {"id":"n2","type":"sender_classifier","params":{"input_email_ids":["n1.items"],"filter_type":"investor"}}
    ]}"#;
    let h = harness(
        FixtureTransport::new(mailbox()),
        &[plan],
        user(false),
        &["mail.read"],
    )
    .await;
    let envelope = h
        .orchestrator
        .handle(request("Emails from investors in the last 30 days"))
        .await;

    assert_eq!(envelope.error_code, None);
    let cited: Vec<&str> = envelope.citations.iter().map(|c| c.item_id.as_str()).collect();
    assert_eq!(cited, vec!["m-investor"]);
}

#[tokio::test]
async fn scenario_what_needs_a_reply() {
    let plan = r#"{"nodes":[
      {"id":"n1","type":"metadata_filter","params":{"domain":"email","filters":["is:unread","newer_than:14d"],"max_results":50}},
      {"id":"n2","type":"action_detector","params":{"input_email_ids":["n1.items"]}}
    ]}"#;
    let h = harness(
        FixtureTransport::new(mailbox()),
        &[plan],
        user(false),
        &["mail.read"],
    )
    .await;
    let envelope = h
        .orchestrator
        .handle(request("What do I need to reply to?"))
        .await;

    assert_eq!(envelope.error_code, None);
    let cited: Vec<&str> = envelope.citations.iter().map(|c| c.item_id.as_str()).collect();
    assert!(cited.contains(&"m-reply"));
    assert!(cited.contains(&"m-urgent"), "urgent mail asks for a response too");
    assert!(!cited.contains(&"m-news"));
}

#[tokio::test]
async fn scenario_ambiguous_reference_asks_back() {
    let plan = r#"{"nodes":[
      {"id":"n1","type":"needs_user_input","params":{"reason":"multiple Davids","candidates":["David Park","David Kim"]}},
      {"id":"n2","type":"metadata_filter","params":{"domain":"email","filters":["is:unread"],"max_results":10}}
    ]}"#;
    let h = harness(
        FixtureTransport::new(mailbox()),
        &[plan],
        user(false),
        &["mail.read"],
    )
    .await;
    let envelope = h.orchestrator.handle(request("Did David reply?")).await;

    assert_eq!(envelope.error_code, None);
    assert!(envelope.answer.contains("multiple Davids"));
    assert!(envelope.answer.contains("David Park"));
    // no provider calls beyond the ambiguity probe
    assert_eq!(h.transport.email_searches.load(Ordering::SeqCst), 0);
    let trace = envelope.trace.unwrap();
    let n2 = trace.nodes.iter().find(|n| n.id == "n2").unwrap();
    assert_eq!(n2.state, "skipped");
}

#[tokio::test]
async fn scenario_provider_outage_fails_fast() {
    let h = harness(
        FixtureTransport::new(mailbox()),
        &[URGENT_PLAN],
        user(false),
        &["mail.read"],
    )
    .await;
    let breaker = h.api.breakers().for_service("email");
    for _ in 0..5 {
        breaker.record_failure();
    }

    let envelope = h
        .orchestrator
        .handle(request("Show me urgent unread emails from this week"))
        .await;
    assert_eq!(envelope.error_code.as_deref(), Some("SERVICE_UNAVAILABLE"));
    assert!(envelope.warnings.iter().any(|w| w.contains("email")));
    assert_eq!(h.transport.email_searches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn scenario_provider_outage_best_effort_degrades() {
    let h = harness(
        FixtureTransport::new(mailbox()),
        &[URGENT_PLAN],
        user(false),
        &["mail.read"],
    )
    .await;
    let breaker = h.api.breakers().for_service("email");
    for _ in 0..5 {
        breaker.record_failure();
    }

    let mut req = request("Show me urgent unread emails from this week");
    req.options.best_effort = Some(true);
    let envelope = h.orchestrator.handle(req).await;

    assert_eq!(envelope.error_code, None);
    assert!(!envelope.warnings.is_empty(), "degradation must be explained");
    assert!(envelope.answer.contains("nothing in your data matches"));
}

#[tokio::test]
async fn scenario_missing_calendar_scope_needs_reauth() {
    let plan = r#"{"nodes":[
      {"id":"n1","type":"metadata_filter","params":{"domain":"calendar","filters":["newer_than:7d"],"max_results":20}}
    ]}"#;
    // calendar enrolled, but the token grant lacks read_calendar
    let h = harness(
        FixtureTransport::new(mailbox()),
        &[plan],
        user(true),
        &["mail.read"],
    )
    .await;
    let envelope = h
        .orchestrator
        .handle(request("What's on my calendar this week?"))
        .await;

    let reauth = envelope.needs_reauth.expect("needsReauth populated");
    assert_eq!(reauth.provider, "google");
    assert_eq!(reauth.reason, "scope");
    assert_eq!(envelope.error_code.as_deref(), Some("NEEDS_REAUTH"));
    assert_eq!(h.transport.calendar_searches.load(Ordering::SeqCst), 0);
}

// ── Invariants ───────────────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_nodes_share_one_provider_call() {
    let plan = r#"{"nodes":[
      {"id":"n1","type":"metadata_filter","params":{"domain":"email","filters":["is:unread"],"max_results":50}},
      {"id":"n2","type":"metadata_filter","params":{"domain":"email","filters":["is:unread"],"max_results":50}},
      {"id":"n3","type":"urgency_detector","params":{"input_email_ids":["n1.items"]}}
    ]}"#;
    let h = harness(
        FixtureTransport::new(mailbox()),
        &[plan],
        user(false),
        &["mail.read"],
    )
    .await;
    let envelope = h.orchestrator.handle(request("unread twice")).await;
    assert_eq!(envelope.error_code, None);
    assert_eq!(
        h.transport.email_searches.load(Ordering::SeqCst),
        1,
        "identical (strategy, params) nodes must coalesce"
    );
}

#[tokio::test]
async fn fixed_plan_and_providers_produce_byte_equal_synthesizer_input() {
    let plan = Plan::from_json(URGENT_PLAN).unwrap();
    let registry = Arc::new(StrategyRegistry::builtin());

    let mut serialized = Vec::new();
    for _ in 0..2 {
        let transport = Arc::new(FixtureTransport::new(mailbox()));
        let tokens = seeded_tokens(&["mail.read"]).await;
        let api = Arc::new(ApiClient::new(
            transport as Arc<dyn ProviderTransport>,
            tokens,
            Arc::new(BreakerRegistry::default()),
            fast_config().retry,
        ));
        let loader = Arc::new(DataLoader::new(
            Arc::clone(&api),
            "u1",
            user(false).enrolled.clone(),
        ));
        let ctx = Arc::new(RequestContext::new(
            user(false),
            loader,
            Arc::new(ScriptedLlm::new(&[])),
            CancellationToken::new(),
            Instant::now() + Duration::from_secs(30),
        ));
        let coordinator = ExecutionCoordinator::new(
            builtin_strategies(),
            Arc::clone(&registry),
            32,
            Duration::from_secs(10),
        );
        let trace = Arc::new(Mutex::new(ExecutionTrace::new(
            "det",
            plan.nodes.iter().map(|n| n.id.clone()),
        )));
        let outcome = coordinator.run(&plan, ctx, trace, None).await.unwrap();
        let input = Synthesizer::build_input(
            "urgent unread",
            &plan,
            &outcome.results,
            &Preferences::default(),
            &outcome.warnings,
        );
        serialized.push(serde_json::to_vec(&input).unwrap());
    }
    assert_eq!(serialized[0], serialized[1]);
}

#[tokio::test]
async fn deadline_cancels_in_flight_nodes_promptly() {
    let h = harness(
        FixtureTransport::hanging(mailbox()),
        &[URGENT_PLAN],
        user(false),
        &["mail.read"],
    )
    .await;
    let mut req = request("urgent unread");
    req.options.deadline_ms = Some(100);

    let started = Instant::now();
    let envelope = h.orchestrator.handle(req).await;
    let elapsed = started.elapsed();

    assert_eq!(envelope.error_code.as_deref(), Some("DEADLINE_EXCEEDED"));
    assert!(
        elapsed < Duration::from_millis(600),
        "in-flight nodes must reach a terminal state within 500ms of the deadline, took {elapsed:?}"
    );
    let trace = envelope.trace.unwrap();
    assert!(trace
        .nodes
        .iter()
        .all(|n| ["cancelled", "failed", "skipped", "succeeded"].contains(&n.state.as_str())));
}

// ── Boundaries and recovery ──────────────────────────────────────────────

#[tokio::test]
async fn empty_candidates_yield_polite_empty_state() {
    let h = harness(
        FixtureTransport::new(json!([])),
        &[URGENT_PLAN],
        user(false),
        &["mail.read"],
    )
    .await;
    let envelope = h.orchestrator.handle(request("urgent unread emails")).await;
    assert_eq!(envelope.error_code, None);
    assert!(envelope.answer.contains("nothing in your data matches"));
    assert!(envelope.citations.is_empty());
}

#[tokio::test]
async fn invalid_plan_is_revised_once_then_succeeds() {
    let bad = r#"{"nodes":[
      {"id":"n1","type":"metadata_filter","params":{"domain":"email","filters":["isUrgent"],"max_results":50}}
    ]}"#;
    let h = harness(
        FixtureTransport::new(mailbox()),
        &[bad, URGENT_PLAN],
        user(false),
        &["mail.read"],
    )
    .await;
    let envelope = h.orchestrator.handle(request("urgent unread emails")).await;
    assert_eq!(envelope.error_code, None);
    assert!(!envelope.citations.is_empty());
}

#[tokio::test]
async fn persistently_invalid_plan_fails_politely() {
    let bad = r#"{"nodes":[
      {"id":"n1","type":"metadata_filter","params":{"domain":"email","filters":["is:unread"],"max_results":0}}
    ]}"#;
    let h = harness(
        FixtureTransport::new(mailbox()),
        &[bad, bad],
        user(false),
        &["mail.read"],
    )
    .await;
    let envelope = h.orchestrator.handle(request("unread emails")).await;
    assert_eq!(envelope.error_code.as_deref(), Some("PLAN_REJECTED"));
    assert!(envelope.answer.contains("rephrase"));
    assert_eq!(h.transport.email_searches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn context_out_carries_both_new_turns() {
    let h = harness(
        FixtureTransport::new(mailbox()),
        &[URGENT_PLAN],
        user(false),
        &["mail.read"],
    )
    .await;
    let envelope = h.orchestrator.handle(request("urgent unread emails")).await;
    let history = envelope.context_out.history;
    assert_eq!(history.len(), 2);
    assert_eq!(history.0[0].content, "urgent unread emails");
    assert_eq!(history.0[1].content, envelope.answer);
}
