//! LLM provider contract.
//!
//! Concrete HTTP backends live outside this workspace; everything here is
//! what the agent loop needs from one: a [`Provider`] trait with synchronous
//! and streaming chat, typed errors that distinguish auth / rate-limit /
//! transient failures, and a retrying decorator that emits `run.retrying`
//! events on recoverable failures.

pub mod error;
pub mod retry;
pub mod testing;
pub mod traits;
pub mod wire;

pub use error::ProviderError;
pub use retry::RetryingProvider;
pub use traits::{ChatRequest, ChatResponse, ChunkSink, Provider, StreamChunk};
