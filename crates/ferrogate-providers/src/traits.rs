//! The `Provider` trait and its request/response types.

use async_trait::async_trait;

use ferrogate_core::types::{Message, ToolCall, ToolDefinition, Usage};

use crate::error::ProviderError;

/// One chat completion request.
#[derive(Clone, Debug)]
pub struct ChatRequest {
    /// Run this call belongs to (threaded into retry events).
    pub run_id: String,
    /// Conversation in provider order: system, history, current user turn.
    pub messages: Vec<Message>,
    /// Tools the model may call; empty disables tool calling.
    pub tools: Vec<ToolDefinition>,
    /// Model identifier.
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

impl ChatRequest {
    pub fn new(run_id: impl Into<String>, model: impl Into<String>, messages: Vec<Message>) -> Self {
        ChatRequest {
            run_id: run_id.into(),
            messages,
            tools: Vec::new(),
            model: model.into(),
            max_tokens: None,
            temperature: None,
        }
    }
}

/// One chat completion response.
#[derive(Clone, Debug, Default)]
pub struct ChatResponse {
    /// Assistant text, if any.
    pub content: Option<String>,
    /// Requested tool calls, in provider order.
    pub tool_calls: Vec<ToolCall>,
    /// Provider-native assistant payload, preserved opaquely so provider
    /// cache blocks survive the session round-trip.
    pub raw_assistant_content: Option<serde_json::Value>,
    pub usage: Usage,
    pub finish_reason: Option<String>,
}

impl ChatResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A streaming fragment. Either field may be set.
#[derive(Clone, Debug, Default)]
pub struct StreamChunk {
    pub content: Option<String>,
    pub thinking: Option<String>,
}

/// Callback receiving stream chunks as they arrive. Must not block: chunk
/// delivery happens on the provider call's task.
pub type ChunkSink<'a> = &'a (dyn Fn(StreamChunk) + Send + Sync);

/// A chat-capable LLM backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Send a chat completion request and wait for the full response.
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Stream a chat completion. `on_chunk` is invoked per fragment; the
    /// complete response is still returned at the end.
    ///
    /// The default implementation falls back to [`chat`](Self::chat) and
    /// emits the final content as a single chunk, for backends without
    /// streaming support.
    async fn chat_stream(
        &self,
        req: ChatRequest,
        on_chunk: ChunkSink<'_>,
    ) -> Result<ChatResponse, ProviderError> {
        let response = self.chat(req).await?;
        if let Some(content) = &response.content {
            on_chunk(StreamChunk {
                content: Some(content.clone()),
                thinking: None,
            });
        }
        Ok(response)
    }

    /// Default model for this provider instance.
    fn default_model(&self) -> &str;

    /// Context window of the given model, when known.
    fn context_window(&self, _model: &str) -> Option<u64> {
        None
    }

    /// Display name for logging and span attribution.
    fn display_name(&self) -> &str;
}
