//! Strategy instances registered at process start, keyed by the same ids
//! the plan registry declares.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::{RequestContext, ResolvedParams, Strategy};
use crate::detectors::{ActionDetector, SenderClassifier, UrgencyDetector};
use crate::error::NodeError;
use crate::result::{Clarification, NodeOutput, NodeValue};
use crate::retrieval::{BatchThreadRead, CrossReference, KeywordSearch, MetadataFilter};
use crate::semantic::SemanticAnalysis;

/// Control node: carries a clarification question instead of doing work.
/// The coordinator short-circuits the rest of the plan when one exists.
pub struct NeedsUserInput;

#[async_trait]
impl Strategy for NeedsUserInput {
    fn id(&self) -> &'static str {
        "needs_user_input"
    }

    async fn execute(
        &self,
        _ctx: &RequestContext,
        params: &ResolvedParams,
    ) -> Result<NodeOutput, NodeError> {
        let reason = params
            .str_param("reason")
            .ok_or_else(|| NodeError::BadInput("needs_user_input needs reason".to_string()))?;
        Ok(NodeOutput::new(NodeValue::Clarification(Clarification {
            reason: reason.to_string(),
            candidates: params.str_list_param("candidates"),
        })))
    }
}

/// The full executable catalog. Ids must stay in lockstep with
/// `StrategyRegistry::builtin()`.
pub fn builtin_strategies() -> BTreeMap<&'static str, Arc<dyn Strategy>> {
    let strategies: Vec<Arc<dyn Strategy>> = vec![
        Arc::new(MetadataFilter),
        Arc::new(KeywordSearch),
        Arc::new(BatchThreadRead),
        Arc::new(CrossReference),
        Arc::new(UrgencyDetector),
        Arc::new(SenderClassifier),
        Arc::new(ActionDetector),
        Arc::new(SemanticAnalysis),
        Arc::new(NeedsUserInput),
    ];
    strategies.into_iter().map(|s| (s.id(), s)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use adjutant_plan::StrategyRegistry;

    #[test]
    fn catalog_matches_registry_vocabulary() {
        let strategies = builtin_strategies();
        let registry = StrategyRegistry::builtin();
        for id in registry.ids() {
            assert!(strategies.contains_key(id), "no executable strategy for {id}");
        }
        for id in strategies.keys() {
            assert!(registry.contains(id), "strategy {id} missing from registry");
        }
    }
}
