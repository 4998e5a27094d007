//! Four-axis scoring. Retrieval and ranking are computed mechanically
//! against ground truth; understanding and presentation go through the
//! LLM judge.

use serde::Serialize;
use tracing::info;

use crate::corpus::QueryCase;
use crate::judge::LlmJudge;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AxisScores {
    pub understanding: u8,
    pub retrieval: u8,
    pub ranking: u8,
    pub presentation: u8,
    pub overall: u8,
}

const UNDERSTANDING_SYSTEM: &str = "You grade whether an assistant understood a mailbox \
question. Reply ONLY {\"score\": 0-100, \"rationale\": \"...\"}.";

const PRESENTATION_SYSTEM: &str = "You grade how well an assistant presented retrieved \
mailbox results (clarity, ordering, tone). Reply ONLY {\"score\": 0-100, \
\"rationale\": \"...\"}.";

/// F1 of cited ids against the ground-truth set, as 0-100.
pub fn retrieval_score(expected: &[String], cited: &[String]) -> u8 {
    if expected.is_empty() {
        return if cited.is_empty() { 100 } else { 0 };
    }
    if cited.is_empty() {
        return 0;
    }
    let hits = cited.iter().filter(|id| expected.contains(id)).count() as f64;
    let precision = hits / cited.len() as f64;
    let recall = hits / expected.len() as f64;
    if precision + recall == 0.0 {
        return 0;
    }
    let f1 = 2.0 * precision * recall / (precision + recall);
    (f1 * 100.0).round() as u8
}

/// Pairwise order concordance against the expected ordering, as 0-100.
/// A pinned item missing from the output counts every one of its pairs
/// as discordant.
pub fn ranking_score(expected_order: &[String], cited: &[String]) -> u8 {
    if expected_order.len() < 2 {
        return 100;
    }
    let position = |id: &String| cited.iter().position(|c| c == id);
    let mut concordant = 0usize;
    let mut total = 0usize;
    for i in 0..expected_order.len() {
        for j in (i + 1)..expected_order.len() {
            total += 1;
            if let (Some(a), Some(b)) = (position(&expected_order[i]), position(&expected_order[j]))
            {
                if a < b {
                    concordant += 1;
                }
            }
        }
    }
    ((concordant as f64 / total as f64) * 100.0).round() as u8
}

pub struct Evaluator {
    judge: LlmJudge,
}

impl Evaluator {
    pub fn new(judge: LlmJudge) -> Self {
        Self { judge }
    }

    pub fn judge(&self) -> &LlmJudge {
        &self.judge
    }

    /// Score one case given the pipeline's answer and citation ids in
    /// presentation order.
    pub async fn evaluate(
        &self,
        case: &QueryCase,
        answer: &str,
        cited_ids: &[String],
    ) -> anyhow::Result<AxisScores> {
        let retrieval = retrieval_score(&case.expected_ids, cited_ids);
        let ranking = ranking_score(&case.expected_order, cited_ids);

        let understanding = self
            .judge
            .score(
                UNDERSTANDING_SYSTEM,
                &format!(
                    "Question: {}\nCase notes: {}\nAssistant answer: {}",
                    case.query, case.notes, answer
                ),
            )
            .await?
            .score;
        let presentation = self
            .judge
            .score(
                PRESENTATION_SYSTEM,
                &format!(
                    "Question: {}\nAnswer: {}\nItems shown (in order): {}",
                    case.query,
                    answer,
                    cited_ids.join(", ")
                ),
            )
            .await?
            .score;

        let overall = ((understanding as u16 + retrieval as u16 + ranking as u16
            + presentation as u16)
            / 4) as u8;
        let scores = AxisScores {
            understanding,
            retrieval,
            ranking,
            presentation,
            overall,
        };
        info!(
            case = %case.id,
            understanding,
            retrieval,
            ranking,
            presentation,
            overall,
            "case scored"
        );
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn retrieval_is_f1_of_cited_vs_expected() {
        // 2 hits out of 3 cited, 2 of 2 expected found: p=2/3 r=1 f1=0.8
        assert_eq!(
            retrieval_score(&ids(&["a", "b"]), &ids(&["a", "b", "x"])),
            80
        );
        assert_eq!(retrieval_score(&ids(&["a", "b"]), &ids(&["a", "b"])), 100);
        assert_eq!(retrieval_score(&ids(&["a"]), &ids(&[])), 0);
        assert_eq!(retrieval_score(&ids(&[]), &ids(&[])), 100);
    }

    #[test]
    fn ranking_counts_preserved_pairs() {
        let expected = ids(&["a", "b", "c"]);
        assert_eq!(ranking_score(&expected, &ids(&["a", "b", "c"])), 100);
        // one inversion out of three pairs
        assert_eq!(ranking_score(&expected, &ids(&["b", "a", "c"])), 67);
        // missing pinned item voids its pairs
        assert_eq!(ranking_score(&expected, &ids(&["a", "c"])), 33);
        // too little pinned order to grade
        assert_eq!(ranking_score(&ids(&["a"]), &ids(&[])), 100);
    }
}
