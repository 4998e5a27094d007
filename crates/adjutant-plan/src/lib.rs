//! Plan model and its gatekeepers: the wire-form DAG, the provider filter
//! grammar, the strategy vocabulary, and the validator that stands between
//! the decomposer and the execution coordinator.

pub mod filters;
pub mod graph;
pub mod registry;
pub mod validator;

pub use filters::{parse_filter, FilterError, FilterOp};
pub use graph::{EdgeRef, Plan, PlanGraphError, PlanNode};
pub use registry::{
    CostClass, OutputField, ParamKind, ParamSpec, StrategyRegistry, StrategySpec,
};
pub use validator::{validate, PlanViolation, ViolationCode};
