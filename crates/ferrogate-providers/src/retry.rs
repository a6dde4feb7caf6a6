//! Retrying provider decorator.
//!
//! Wraps any [`Provider`] and retries recoverable failures: transient errors
//! up to `max_retries` with exponential back-off, rate limits exactly once.
//! Each retry publishes a `run.retrying` event so channels can surface
//! progress. Auth errors and cancellation pass through untouched.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use ferrogate_core::bus::events::{AgentEvent, EventPublisher};

use crate::error::ProviderError;
use crate::traits::{ChatRequest, ChatResponse, ChunkSink, Provider};

/// Retry policy knobs.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Attempts after the first for transient errors.
    pub max_retries: u32,
    /// Base back-off; doubles per attempt.
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(500),
        }
    }
}

/// A [`Provider`] that retries recoverable failures of an inner provider.
pub struct RetryingProvider<P> {
    inner: P,
    policy: RetryPolicy,
    events: EventPublisher,
}

impl<P: Provider> RetryingProvider<P> {
    pub fn new(inner: P, policy: RetryPolicy, events: EventPublisher) -> Self {
        Self {
            inner,
            policy,
            events,
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        self.policy.base_backoff * 2u32.saturating_pow(attempt)
    }

    /// Whether another attempt is allowed after `error` on `attempt`
    /// (0-based) attempts so far.
    fn may_retry(&self, error: &ProviderError, attempt: u32) -> bool {
        match error {
            // Rate limits get exactly one retry.
            ProviderError::RateLimited(_) => attempt == 0,
            ProviderError::Transient(_) => attempt < self.policy.max_retries,
            _ => false,
        }
    }

    async fn run_with_retry<F, Fut>(
        &self,
        run_id: &str,
        mut call: F,
    ) -> Result<ChatResponse, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<ChatResponse, ProviderError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match call().await {
                Ok(response) => return Ok(response),
                Err(error) if self.may_retry(&error, attempt) => {
                    attempt += 1;
                    let delay = self.backoff_for(attempt - 1);
                    warn!(
                        run_id = %run_id,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying provider call"
                    );
                    self.events.publish(AgentEvent::RunRetrying {
                        run_id: run_id.to_string(),
                        attempt,
                        error: error.to_string(),
                    });
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[async_trait]
impl<P: Provider> Provider for RetryingProvider<P> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let run_id = req.run_id.clone();
        self.run_with_retry(&run_id, || self.inner.chat(req.clone()))
            .await
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
        on_chunk: ChunkSink<'_>,
    ) -> Result<ChatResponse, ProviderError> {
        let run_id = req.run_id.clone();
        self.run_with_retry(&run_id, || self.inner.chat_stream(req.clone(), on_chunk))
            .await
    }

    fn default_model(&self) -> &str {
        self.inner.default_model()
    }

    fn context_window(&self, model: &str) -> Option<u64> {
        self.inner.context_window(model)
    }

    fn display_name(&self) -> &str {
        self.inner.display_name()
    }
}
