//! The three-layer query orchestrator: decompose a natural-language query
//! into a typed plan (L1), execute the plan concurrently against the
//! providers (L2), synthesize a user-facing reply from typed results (L3).

pub mod coordinator;
pub mod decomposer;
pub mod orchestrator;
pub mod progress;
pub mod synthesizer;

pub use coordinator::{ExecError, ExecOutcome, ExecutionCoordinator};
pub use decomposer::{DecomposeError, Decomposer};
pub use orchestrator::{Orchestrator, UserContextSource};
pub use progress::ProgressEvent;
pub use synthesizer::{ResponseShape, SynthesisInput, SynthesisOutput, Synthesizer};
