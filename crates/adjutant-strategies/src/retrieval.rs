//! Retrieval strategies: provider-native search, free-text search, batched
//! thread reads, and the handle-list join.

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::debug;

use crate::context::{RequestContext, ResolvedParams, Strategy};
use crate::error::NodeError;
use crate::result::{JoinedPair, NodeOutput, NodeValue};

const DEFAULT_KEYWORD_RESULTS: u64 = 25;

/// Provider-native search over one domain using the whitelisted operator
/// grammar. Filters arrive pre-validated.
pub struct MetadataFilter;

#[async_trait]
impl Strategy for MetadataFilter {
    fn id(&self) -> &'static str {
        "metadata_filter"
    }

    async fn execute(
        &self,
        ctx: &RequestContext,
        params: &ResolvedParams,
    ) -> Result<NodeOutput, NodeError> {
        ctx.check_cancelled()?;
        let domain = params
            .str_param("domain")
            .ok_or_else(|| NodeError::BadInput("metadata_filter needs domain".to_string()))?;
        let filters = params.str_list_param("filters");
        let max_results = params.u64_param("max_results").unwrap_or(50);
        let query = filters.join(" ");
        debug!(node = %params.node_id, domain, %query, "metadata filter search");

        let output = match domain {
            "email" => {
                let page = ctx.mail.search(&query, max_results).await?;
                NodeOutput::new(NodeValue::Emails(page.items)).truncated(page.truncated)
            }
            "calendar" => {
                let page = ctx.calendar.search(&query, max_results).await?;
                NodeOutput::new(NodeValue::Events(page.items)).truncated(page.truncated)
            }
            "contacts" => {
                let page = ctx.contacts.search(&query, max_results).await?;
                NodeOutput::new(NodeValue::Contacts(page.items)).truncated(page.truncated)
            }
            other => {
                return Err(NodeError::BadInput(format!("unknown domain {other:?}")));
            }
        };
        Ok(output)
    }
}

/// Free-text ranked search over one domain.
pub struct KeywordSearch;

#[async_trait]
impl Strategy for KeywordSearch {
    fn id(&self) -> &'static str {
        "keyword_search"
    }

    async fn execute(
        &self,
        ctx: &RequestContext,
        params: &ResolvedParams,
    ) -> Result<NodeOutput, NodeError> {
        ctx.check_cancelled()?;
        let domain = params
            .str_param("domain")
            .ok_or_else(|| NodeError::BadInput("keyword_search needs domain".to_string()))?;
        let query = params
            .str_param("query")
            .ok_or_else(|| NodeError::BadInput("keyword_search needs query".to_string()))?;
        let max_results = params
            .u64_param("max_results")
            .unwrap_or(DEFAULT_KEYWORD_RESULTS);

        let output = match domain {
            "email" => {
                let page = ctx.mail.search(query, max_results).await?;
                NodeOutput::new(NodeValue::Emails(page.items)).truncated(page.truncated)
            }
            "calendar" => {
                let page = ctx.calendar.search(query, max_results).await?;
                NodeOutput::new(NodeValue::Events(page.items)).truncated(page.truncated)
            }
            "contacts" => {
                let page = ctx.contacts.search(query, max_results).await?;
                NodeOutput::new(NodeValue::Contacts(page.items)).truncated(page.truncated)
            }
            other => {
                return Err(NodeError::BadInput(format!("unknown domain {other:?}")));
            }
        };
        Ok(output)
    }
}

/// Fetch full thread bodies for the referenced email list. Individual
/// fetches coalesce into provider batch calls through the loader.
pub struct BatchThreadRead;

#[async_trait]
impl Strategy for BatchThreadRead {
    fn id(&self) -> &'static str {
        "batch_thread_read"
    }

    async fn execute(
        &self,
        ctx: &RequestContext,
        params: &ResolvedParams,
    ) -> Result<NodeOutput, NodeError> {
        ctx.check_cancelled()?;
        let input = params.input("input_email_ids")?;
        let handles = input
            .email_handles()
            .ok_or_else(|| NodeError::BadInput("input is not an email list".to_string()))?;

        let mut thread_ids: Vec<String> = Vec::new();
        for handle in &handles {
            if !thread_ids.contains(&handle.thread_id) {
                thread_ids.push(handle.thread_id.clone());
            }
        }

        let fetches = thread_ids.iter().map(|id| ctx.mail.get_thread(id));
        let results = join_all(fetches).await;
        ctx.check_cancelled()?;

        let mut threads = Vec::new();
        let mut warnings = Vec::new();
        for (id, result) in thread_ids.iter().zip(results) {
            match result {
                Ok(thread) => threads.push(thread),
                Err(adjutant_providers::ApiError::NotFound(_)) => {
                    warnings.push(format!("thread {id} no longer exists"));
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut output = NodeOutput::new(NodeValue::Threads(threads));
        output.warnings = warnings;
        Ok(output)
    }
}

/// Join an email list and an event list on a shared key.
pub struct CrossReference;

fn normalized(s: &str) -> String {
    s.trim().to_lowercase()
}

#[async_trait]
impl Strategy for CrossReference {
    fn id(&self) -> &'static str {
        "cross_reference"
    }

    async fn execute(
        &self,
        ctx: &RequestContext,
        params: &ResolvedParams,
    ) -> Result<NodeOutput, NodeError> {
        ctx.check_cancelled()?;
        let join_key = params
            .str_param("join_key")
            .ok_or_else(|| NodeError::BadInput("cross_reference needs join_key".to_string()))?;

        let left = params.input("left")?;
        let right = params.input("right")?;
        let emails = left
            .email_handles()
            .ok_or_else(|| NodeError::BadInput("left input is not an email list".to_string()))?;
        let events = match right {
            NodeValue::Events(events) => events.clone(),
            _ => {
                return Err(NodeError::BadInput(
                    "right input is not an event list".to_string(),
                ))
            }
        };

        let mut pairs = Vec::new();
        for email in &emails {
            for event in &events {
                let matched = match join_key {
                    "sender_email" | "attendee_email" => event
                        .attendees
                        .iter()
                        .any(|a| normalized(&a.email) == normalized(&email.from.email)),
                    "subject" => normalized(&event.title) == normalized(&email.subject),
                    _ => false,
                };
                if matched {
                    pairs.push(JoinedPair {
                        email: email.clone(),
                        event: event.clone(),
                        key: join_key.to_string(),
                    });
                }
            }
        }
        Ok(NodeOutput::new(NodeValue::Pairs(pairs)))
    }
}
