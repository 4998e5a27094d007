//! LLM-backed evaluation over a small bounded subset. The expensive last
//! resort: plans should only reach for this when the cheap detectors
//! cannot answer.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use adjutant_providers::llm::{extract_json, LlmRequest};

use crate::context::{RequestContext, ResolvedParams, Strategy};
use crate::error::NodeError;
use crate::result::{NodeOutput, NodeValue, SemanticVerdict};

/// Hard cap on items sent to the LLM regardless of the plan's ask.
const MAX_SEMANTIC_ITEMS: usize = 20;

const SYSTEM_PROMPT: &str = "You judge email relevance. Reply with ONLY a JSON array; \
one object per item: {\"id\": string, \"relevant\": boolean, \"note\": short string}. \
No prose, no markdown.";

#[derive(Deserialize)]
struct WireVerdict {
    id: String,
    relevant: bool,
    #[serde(default)]
    note: String,
}

pub struct SemanticAnalysis;

#[async_trait]
impl Strategy for SemanticAnalysis {
    fn id(&self) -> &'static str {
        "semantic_analysis"
    }

    async fn execute(
        &self,
        ctx: &RequestContext,
        params: &ResolvedParams,
    ) -> Result<NodeOutput, NodeError> {
        ctx.check_cancelled()?;
        let question = params
            .str_param("question")
            .ok_or_else(|| NodeError::BadInput("semantic_analysis needs question".to_string()))?;
        let handles = params
            .input("input_items")?
            .email_handles()
            .ok_or_else(|| NodeError::BadInput("input is not an email list".to_string()))?;

        let limit = params
            .u64_param("max_items")
            .map(|n| n as usize)
            .unwrap_or(MAX_SEMANTIC_ITEMS)
            .min(MAX_SEMANTIC_ITEMS);
        let truncated = handles.len() > limit;
        let subset = &handles[..handles.len().min(limit)];

        if subset.is_empty() {
            return Ok(NodeOutput::new(NodeValue::Verdicts(Vec::new())));
        }

        let mut prompt = format!("Question: {question}\n\nItems:\n");
        for handle in subset {
            prompt.push_str(&format!(
                "- id={} from={} subject={:?} snippet={:?}\n",
                handle.id, handle.from.email, handle.subject, handle.snippet
            ));
        }

        debug!(node = %params.node_id, items = subset.len(), "semantic analysis call");
        let response = ctx
            .llm
            .complete(&LlmRequest::single(SYSTEM_PROMPT, &prompt))
            .await
            .map_err(|e| NodeError::Llm(e.to_string()))?;
        ctx.check_cancelled()?;

        let wire: Vec<WireVerdict> = serde_json::from_str(extract_json(&response.content))
            .map_err(|e| NodeError::Llm(format!("unparseable verdict payload: {e}")))?;

        // Preserve input order; items the model skipped default to
        // not-relevant rather than vanishing.
        let verdicts: Vec<SemanticVerdict> = subset
            .iter()
            .map(|handle| {
                wire.iter()
                    .find(|w| w.id == handle.id)
                    .map(|w| SemanticVerdict {
                        item_id: w.id.clone(),
                        relevant: w.relevant,
                        note: w.note.clone(),
                    })
                    .unwrap_or(SemanticVerdict {
                        item_id: handle.id.clone(),
                        relevant: false,
                        note: String::new(),
                    })
            })
            .collect();

        Ok(NodeOutput::new(NodeValue::Verdicts(verdicts)).truncated(truncated))
    }
}
