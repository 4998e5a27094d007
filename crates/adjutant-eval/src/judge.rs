//! LLM-as-judge with a prompt-hash cache. In cached mode no fresh model
//! calls are allowed, which makes regression reruns fully deterministic.

use std::sync::Arc;

use anyhow::{bail, Context};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use adjutant_providers::llm::{extract_json, LlmClient, LlmRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// Fresh LLM calls; judgments are recorded into the cache.
    Full,
    /// Cache only; a miss is an error rather than a fresh call.
    Cached,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Judgment {
    pub score: u8,
    #[serde(default)]
    pub rationale: String,
}

/// Judgments keyed by SHA-256 of `(system, prompt)`.
#[derive(Default)]
pub struct JudgmentCache {
    entries: DashMap<String, Judgment>,
}

impl JudgmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(system: &str, prompt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(system.as_bytes());
        hasher.update(b"\n--\n");
        hasher.update(prompt.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn get(&self, system: &str, prompt: &str) -> Option<Judgment> {
        self.entries.get(&Self::key(system, prompt)).map(|j| j.clone())
    }

    pub fn put(&self, system: &str, prompt: &str, judgment: Judgment) {
        self.entries.insert(Self::key(system, prompt), judgment);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize all judgments for reuse in a later cached run.
    pub fn snapshot(&self) -> String {
        let map: std::collections::BTreeMap<String, Judgment> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        serde_json::to_string(&map).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn restore(json: &str) -> anyhow::Result<Self> {
        let map: std::collections::BTreeMap<String, Judgment> =
            serde_json::from_str(json).context("judgment snapshot did not parse")?;
        let cache = Self::new();
        for (key, judgment) in map {
            cache.entries.insert(key, judgment);
        }
        Ok(cache)
    }
}

pub struct LlmJudge {
    llm: Arc<dyn LlmClient>,
    cache: JudgmentCache,
    mode: EvalMode,
}

impl LlmJudge {
    pub fn new(llm: Arc<dyn LlmClient>, cache: JudgmentCache, mode: EvalMode) -> Self {
        Self { llm, cache, mode }
    }

    pub fn cache(&self) -> &JudgmentCache {
        &self.cache
    }

    /// Score one axis 0-100. The judge prompt must instruct the model to
    /// reply with `{"score": n, "rationale": "..."}` and nothing else.
    pub async fn score(&self, system: &str, prompt: &str) -> anyhow::Result<Judgment> {
        if let Some(hit) = self.cache.get(system, prompt) {
            debug!("judge cache hit");
            return Ok(hit);
        }
        if self.mode == EvalMode::Cached {
            bail!("cached evaluation mode has no judgment for this prompt");
        }

        let response = self
            .llm
            .complete(&LlmRequest::single(system, prompt))
            .await
            .map_err(|e| anyhow::anyhow!("judge LLM call failed: {e}"))?;
        let judgment: Judgment = serde_json::from_str(extract_json(&response.content))
            .context("judge reply was not a score object")?;
        if judgment.score > 100 {
            bail!("judge score {} out of range", judgment.score);
        }
        self.cache.put(system, prompt, judgment.clone());
        Ok(judgment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adjutant_providers::llm::{LlmError, LlmResponse};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLlm {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for CountingLlm {
        fn name(&self) -> &str {
            "counting"
        }
        async fn complete(&self, _req: &LlmRequest) -> Result<LlmResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(LlmResponse {
                content: r#"{"score": 80, "rationale": "solid"}"#.to_string(),
                model: "counting".to_string(),
                tokens_in: 0,
                tokens_out: 0,
            })
        }
    }

    #[tokio::test]
    async fn full_mode_caches_judgments() {
        let llm = Arc::new(CountingLlm {
            calls: AtomicUsize::new(0),
        });
        let judge = LlmJudge::new(llm.clone(), JudgmentCache::new(), EvalMode::Full);

        let a = judge.score("sys", "same prompt").await.unwrap();
        let b = judge.score("sys", "same prompt").await.unwrap();
        assert_eq!(a.score, b.score);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cached_mode_never_calls_the_model() {
        let warm = Arc::new(CountingLlm {
            calls: AtomicUsize::new(0),
        });
        let judge = LlmJudge::new(warm.clone(), JudgmentCache::new(), EvalMode::Full);
        judge.score("sys", "prompt-1").await.unwrap();
        let snapshot = judge.cache().snapshot();

        let cold = Arc::new(CountingLlm {
            calls: AtomicUsize::new(0),
        });
        let replay = LlmJudge::new(
            cold.clone(),
            JudgmentCache::restore(&snapshot).unwrap(),
            EvalMode::Cached,
        );
        let judgment = replay.score("sys", "prompt-1").await.unwrap();
        assert_eq!(judgment.score, 80);
        assert_eq!(cold.calls.load(Ordering::SeqCst), 0);

        // A prompt outside the snapshot is a hard miss, not a fresh call.
        assert!(replay.score("sys", "prompt-2").await.is_err());
        assert_eq!(cold.calls.load(Ordering::SeqCst), 0);
    }
}
