//! L1 — turn `(query, history, user context)` into a typed plan.
//!
//! The model only ever sees the strict vocabulary document generated from
//! the registry; it cannot invent strategy names or filter operators that
//! the validator would not recognize, and when it tries anyway the
//! validator's feedback drives a single revision attempt.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use adjutant_core::types::{ConversationHistory, Role, UserContext};
use adjutant_plan::filters::{grammar_summary, FORBIDDEN_SYNONYMS};
use adjutant_plan::{ParamKind, Plan, PlanViolation, StrategyRegistry};
use adjutant_providers::llm::{extract_json, LlmClient, LlmRequest};

#[derive(Debug, Error)]
pub enum DecomposeError {
    #[error("LLM call failed: {0}")]
    Llm(String),

    #[error("model produced unparseable plan: {0}")]
    Unparseable(String),
}

pub struct Decomposer {
    llm: Arc<dyn LlmClient>,
    registry: Arc<StrategyRegistry>,
}

impl Decomposer {
    pub fn new(llm: Arc<dyn LlmClient>, registry: Arc<StrategyRegistry>) -> Self {
        Self { llm, registry }
    }

    /// The strict vocabulary document: every strategy with its params and
    /// outputs, the allowed filter grammar, and the forbidden synonyms.
    pub fn vocabulary(&self) -> String {
        let mut doc = String::from(
            "You decompose assistant queries into a JSON plan: \
             {\"nodes\":[{\"id\",\"type\",\"params\"}],\"best_effort\":bool}.\n\
             Reference an upstream output as \"<nodeId>.<field>\" in params.\n\
             Default pattern: a metadata_filter or keyword_search narrows \
             candidates with provider-native operators, then detector \
             strategies refine them. Never answer from memory; never invent \
             strategy or filter names. If the query is ambiguous (e.g. which \
             \"David\"), emit a needs_user_input node instead of guessing.\n\n\
             Strategies:\n",
        );
        for spec in self.registry.iter() {
            doc.push_str(&format!("- {} — {}\n", spec.id, spec.summary));
            for param in &spec.params {
                let kind = match &param.kind {
                    ParamKind::Str => "string".to_string(),
                    ParamKind::Int => "integer".to_string(),
                    ParamKind::Bool => "boolean".to_string(),
                    ParamKind::StrList => "list of strings".to_string(),
                    ParamKind::Reference => "nodeId.field reference".to_string(),
                    ParamKind::Choice(options) => format!("one of {options:?}"),
                };
                let req = if param.required { "required" } else { "optional" };
                doc.push_str(&format!("    param {}: {kind} ({req})\n", param.name));
            }
            for output in &spec.outputs {
                doc.push_str(&format!("    output {}: {}\n", output.name, output.ty));
            }
        }
        doc.push_str(&format!(
            "\nAllowed metadata_filter operators: {}\n\
             FORBIDDEN as filters (use detector strategies instead): {}\n",
            grammar_summary(),
            FORBIDDEN_SYNONYMS.join(", ")
        ));
        doc
    }

    pub async fn decompose(
        &self,
        query: &str,
        history: &ConversationHistory,
        user: &UserContext,
        feedback: Option<&[PlanViolation]>,
    ) -> Result<Plan, DecomposeError> {
        let mut prompt = format!(
            "User context: timezone={} locale={} enrolled={:?}\n\n",
            user.timezone,
            user.locale,
            user.enrolled.keys().map(|k| k.as_str()).collect::<Vec<_>>(),
        );
        if !history.is_empty() {
            prompt.push_str("Conversation so far:\n");
            for turn in &history.0 {
                let role = match turn.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::System => "system",
                };
                prompt.push_str(&format!("{role}: {}\n", turn.content));
            }
            prompt.push('\n');
        }
        prompt.push_str(&format!("Query: {query}\n"));
        if let Some(violations) = feedback {
            prompt.push_str("\nYour previous plan was rejected:\n");
            for violation in violations {
                prompt.push_str(&format!("- {violation}\n"));
            }
            prompt.push_str("Emit a corrected plan.\n");
        }
        prompt.push_str("\nReply with ONLY the plan JSON.");

        debug!(query, revision = feedback.is_some(), "decomposing query");
        let response = self
            .llm
            .complete(&LlmRequest::single(&self.vocabulary(), &prompt))
            .await
            .map_err(|e| DecomposeError::Llm(e.to_string()))?;

        Plan::from_json(extract_json(&response.content)).map_err(|e| {
            warn!(error = %e, "plan JSON did not parse");
            DecomposeError::Unparseable(e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adjutant_providers::llm::{LlmError, LlmResponse};
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    struct CannedLlm(String);

    #[async_trait]
    impl LlmClient for CannedLlm {
        fn name(&self) -> &str {
            "canned"
        }
        async fn complete(&self, _req: &LlmRequest) -> Result<LlmResponse, LlmError> {
            Ok(LlmResponse {
                content: self.0.clone(),
                model: "canned".to_string(),
                tokens_in: 0,
                tokens_out: 0,
            })
        }
    }

    fn user() -> UserContext {
        UserContext {
            user_id: "u1".to_string(),
            enrolled: BTreeMap::new(),
            timezone: "UTC".to_string(),
            locale: "en-US".to_string(),
            preferences: Default::default(),
            vip: vec![],
            org_domain: String::new(),
        }
    }

    #[test]
    fn vocabulary_names_every_strategy_and_the_blacklist() {
        let decomposer = Decomposer::new(
            Arc::new(CannedLlm(String::new())),
            Arc::new(StrategyRegistry::builtin()),
        );
        let doc = decomposer.vocabulary();
        for id in ["metadata_filter", "urgency_detector", "needs_user_input"] {
            assert!(doc.contains(id));
        }
        assert!(doc.contains("isUrgent"));
        assert!(doc.contains("newer_than:<N>d"));
    }

    #[tokio::test]
    async fn fenced_plan_json_is_accepted() {
        let wire = "Here you go:\n```json\n{\"nodes\":[{\"id\":\"n1\",\"type\":\"metadata_filter\",\"params\":{\"domain\":\"email\",\"filters\":[\"is:unread\"],\"max_results\":10}}]}\n```";
        let decomposer = Decomposer::new(
            Arc::new(CannedLlm(wire.to_string())),
            Arc::new(StrategyRegistry::builtin()),
        );
        let plan = decomposer
            .decompose("unread mail", &ConversationHistory::default(), &user(), None)
            .await
            .unwrap();
        assert_eq!(plan.nodes.len(), 1);
        assert_eq!(plan.nodes[0].strategy, "metadata_filter");
    }

    #[tokio::test]
    async fn prose_only_reply_is_an_error() {
        let decomposer = Decomposer::new(
            Arc::new(CannedLlm("I cannot plan this".to_string())),
            Arc::new(StrategyRegistry::builtin()),
        );
        let err = decomposer
            .decompose("hm", &ConversationHistory::default(), &user(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DecomposeError::Unparseable(_)));
    }
}
