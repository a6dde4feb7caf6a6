//! Typed provider errors.
//!
//! The error kind drives the disposition: auth errors surface immediately,
//! rate limits retry once with back-off, transient errors retry with
//! escalation, cancellation propagates as-is.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP 401/403 — credentials are wrong; retrying cannot help.
    #[error("provider authentication failed: {0}")]
    Auth(String),

    /// HTTP 429 — the provider asked us to slow down.
    #[error("provider rate limited: {0}")]
    RateLimited(String),

    /// Network failures and 5xx responses — worth retrying.
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// The run was cancelled while the call was in flight.
    #[error("provider call cancelled")]
    Cancelled,

    /// Anything else (malformed response, unsupported model, ...).
    #[error("provider error: {0}")]
    Other(String),
}

impl ProviderError {
    /// Whether the retry layer should attempt this call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient(_) | ProviderError::RateLimited(_)
        )
    }

    /// Whether this is a cancellation, which must propagate silently.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProviderError::Cancelled)
    }
}
