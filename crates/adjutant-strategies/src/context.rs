//! Per-request arena handed to every strategy: user context, the request's
//! DataLoader and service façades, the shared LLM client, and the
//! cancellation signal. Created at request entry, discarded at response.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use adjutant_core::types::UserContext;
use adjutant_providers::loader::DataLoader;
use adjutant_providers::llm::LlmClient;
use adjutant_providers::services::{CalendarService, ContactsService, MailService};

use crate::error::NodeError;
use crate::result::{NodeOutput, NodeValue};

pub struct RequestContext {
    pub user: UserContext,
    pub loader: Arc<DataLoader>,
    pub mail: MailService,
    pub calendar: CalendarService,
    pub contacts: ContactsService,
    pub llm: Arc<dyn LlmClient>,
    pub cancel: CancellationToken,
    pub deadline: Instant,
}

impl RequestContext {
    pub fn new(
        user: UserContext,
        loader: Arc<DataLoader>,
        llm: Arc<dyn LlmClient>,
        cancel: CancellationToken,
        deadline: Instant,
    ) -> Self {
        Self {
            mail: MailService::new(Arc::clone(&loader)),
            calendar: CalendarService::new(Arc::clone(&loader)),
            contacts: ContactsService::new(Arc::clone(&loader)),
            user,
            loader,
            llm,
            cancel,
            deadline,
        }
    }

    /// Strategies call this at every external boundary.
    pub fn check_cancelled(&self) -> Result<(), NodeError> {
        if self.cancel.is_cancelled() || Instant::now() >= self.deadline {
            Err(NodeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Node params with upstream references already resolved to their values.
#[derive(Debug, Clone)]
pub struct ResolvedParams {
    pub node_id: String,
    pub raw: serde_json::Map<String, Value>,
    pub inputs: BTreeMap<String, NodeValue>,
}

impl ResolvedParams {
    pub fn str_param(&self, name: &str) -> Option<&str> {
        self.raw.get(name).and_then(Value::as_str)
    }

    pub fn u64_param(&self, name: &str) -> Option<u64> {
        self.raw.get(name).and_then(Value::as_u64)
    }

    pub fn str_list_param(&self, name: &str) -> Vec<String> {
        self.raw
            .get(name)
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resolved upstream value for a reference param.
    pub fn input(&self, name: &str) -> Result<&NodeValue, NodeError> {
        self.inputs
            .get(name)
            .ok_or_else(|| NodeError::BadInput(format!("missing resolved input {name:?}")))
    }
}

/// A named, typed unit of retrieval or analysis.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn id(&self) -> &'static str;

    async fn execute(
        &self,
        ctx: &RequestContext,
        params: &ResolvedParams,
    ) -> Result<NodeOutput, NodeError>;
}
