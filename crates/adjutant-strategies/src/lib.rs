//! The strategy catalog: concrete retrieval and analysis units composed by
//! plans. Strategies are pure with respect to their declared inputs and the
//! external providers; every external call goes through the request's
//! DataLoader and polls cancellation at the boundary.

pub mod catalog;
pub mod context;
pub mod detectors;
pub mod error;
pub mod result;
pub mod retrieval;
pub mod semantic;

pub use catalog::builtin_strategies;
pub use context::{RequestContext, ResolvedParams, Strategy};
pub use error::NodeError;
pub use result::{NodeOutput, NodeValue};
