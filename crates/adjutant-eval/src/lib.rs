//! Grading harness: scores end-to-end responses on understanding,
//! retrieval, ranking, and presentation against a labeled synthetic
//! corpus. Ground truth never reaches the production pipeline; it lives
//! only here.

pub mod corpus;
pub mod harness;
pub mod judge;

pub use corpus::{Corpus, QueryCase};
pub use harness::{AxisScores, Evaluator};
pub use judge::{EvalMode, Judgment, JudgmentCache, LlmJudge};
