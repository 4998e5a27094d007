//! Core types shared across the adjutant workspace: configuration, the
//! top-level error enum, request/response wire types, and the per-request
//! execution trace.

pub mod config;
pub mod error;
pub mod trace;
pub mod types;

pub use config::AdjutantConfig;
pub use error::{AdjutantError, Result};
