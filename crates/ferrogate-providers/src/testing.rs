//! Scripted provider for tests and local smoke runs.
//!
//! Returns a fixed sequence of responses, then echoes the last user message.
//! Every crate in the workspace scripts its agent-loop tests with this
//! instead of hand-rolling a mock per test module.

use std::sync::Mutex;

use async_trait::async_trait;

use ferrogate_core::types::Message;

use crate::error::ProviderError;
use crate::traits::{ChatRequest, ChatResponse, Provider};

/// A provider that replays a scripted response sequence.
pub struct ScriptedProvider {
    script: Mutex<Vec<Result<ChatResponse, ProviderError>>>,
    model: String,
    context_window: Option<u64>,
}

impl ScriptedProvider {
    /// Provider that replays `responses` in order, echoing afterwards.
    pub fn new(responses: Vec<ChatResponse>) -> Self {
        Self {
            script: Mutex::new(responses.into_iter().map(Ok).collect()),
            model: "scripted".to_string(),
            context_window: Some(200_000),
        }
    }

    /// Provider that always answers with the same text.
    pub fn simple(text: &str) -> Self {
        Self::new(vec![ChatResponse {
            content: Some(text.to_string()),
            finish_reason: Some("stop".into()),
            ..Default::default()
        }])
    }

    /// Provider that replays results, errors included.
    pub fn with_results(results: Vec<Result<ChatResponse, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(results),
            model: "scripted".to_string(),
            context_window: Some(200_000),
        }
    }

    /// Override the advertised context window.
    pub fn with_context_window(mut self, window: Option<u64>) -> Self {
        self.context_window = window;
        self
    }

    fn echo(req: &ChatRequest) -> ChatResponse {
        let last = req
            .messages
            .iter()
            .rev()
            .find_map(|m| match m {
                Message::User { content } => Some(content.as_text()),
                _ => None,
            })
            .unwrap_or_default();
        ChatResponse {
            content: Some(last),
            finish_reason: Some("stop".into()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            Ok(Self::echo(&req))
        } else {
            script.remove(0)
        }
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn context_window(&self, _model: &str) -> Option<u64> {
        self.context_window
    }

    fn display_name(&self) -> &str {
        "ScriptedProvider"
    }
}
