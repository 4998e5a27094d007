//! Labeled synthetic mailboxes and query cases. Serialized as plain JSON
//! fixtures checked in next to the tests that use them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One labeled query against a synthetic mailbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryCase {
    pub id: String,
    pub query: String,
    /// Ground-truth relevant item ids (unordered).
    pub expected_ids: Vec<String>,
    /// Expected presentation order, best first. May list a subset of
    /// `expected_ids` when only the top of the list is pinned down.
    #[serde(default)]
    pub expected_order: Vec<String>,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Corpus {
    pub name: String,
    /// Synthetic mailbox items in provider wire form, fed to a fake
    /// transport when replaying cases through the pipeline.
    pub mailbox: Value,
    pub cases: Vec<QueryCase>,
}

impl Corpus {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn case(&self, id: &str) -> Option<&QueryCase> {
        self.cases.iter().find(|c| c.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corpus_fixture_parses() {
        let corpus = Corpus::from_json(
            r#"{
              "name": "smoke",
              "mailbox": [{"id": "m1"}],
              "cases": [{
                "id": "c1",
                "query": "urgent mail",
                "expected_ids": ["m1"],
                "expected_order": ["m1"]
              }]
            }"#,
        )
        .unwrap();
        assert_eq!(corpus.cases.len(), 1);
        assert_eq!(corpus.case("c1").unwrap().expected_ids, vec!["m1"]);
        assert!(corpus.case("c2").is_none());
    }
}
