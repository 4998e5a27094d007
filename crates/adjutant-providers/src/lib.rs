//! Provider-facing infrastructure: token lifecycle, circuit breaking, the
//! uniform API client, per-request call coalescing, typed service façades,
//! and the shared LLM client.
//!
//! Layering inside one request:
//! strategy → service façade → DataLoader → ApiClient → transport
//! with ApiClient consulting TokenProvider and the breaker registry.

pub mod breaker;
pub mod client;
pub mod error;
pub mod llm;
pub mod loader;
pub mod services;
pub mod token;

pub use breaker::{BreakerEntry, BreakerRegistry, BreakerStatus};
pub use client::{ApiClient, ProviderTransport};
pub use error::ApiError;
pub use llm::{LlmClient, LlmError, LlmRequest, LlmResponse};
pub use loader::DataLoader;
pub use token::{AccessToken, AuthExchanger, TokenError, TokenProvider, TokenRecord, TokenStore};
