//! OpenAI-compatible wire types.
//!
//! The transport (HTTP client, SSE reader) lives outside this workspace,
//! but the wire shape is part of the contract: backends deserialize into
//! these and convert to [`ChatResponse`](crate::ChatResponse) so every
//! OpenAI-compatible API behaves identically past this boundary.

use serde::{Deserialize, Serialize};

use ferrogate_core::types::{Message, ToolCall, ToolDefinition, Usage};

use crate::traits::ChatResponse;

/// Request body for an OpenAI-compatible chat completion API.
#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub stream: bool,
}

impl ChatCompletionRequest {
    /// Build a request from the provider-facing [`crate::ChatRequest`].
    pub fn from_request(req: &crate::ChatRequest, stream: bool) -> Self {
        ChatCompletionRequest {
            model: req.model.clone(),
            messages: req.messages.clone(),
            tools: if req.tools.is_empty() {
                None
            } else {
                Some(req.tools.clone())
            },
            tool_choice: if req.tools.is_empty() {
                None
            } else {
                Some("auto".to_string())
            },
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            stream,
        }
    }
}

/// Raw chat completion response.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: Option<String>,
    pub choices: Vec<ChatChoice>,
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    pub message: WireAssistantMessage,
    pub finish_reason: Option<String>,
}

/// The assistant message within a choice. The raw JSON value is preserved
/// alongside the parsed fields so provider cache blocks survive storage.
#[derive(Debug, Deserialize)]
pub struct WireAssistantMessage {
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
}

/// Token accounting in the OpenAI shape.
#[derive(Debug, Default, Deserialize)]
pub struct WireUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
}

impl From<WireUsage> for Usage {
    fn from(w: WireUsage) -> Self {
        Usage {
            prompt_tokens: w.prompt_tokens,
            completion_tokens: w.completion_tokens,
            cache_creation_tokens: w.cache_creation_input_tokens,
            cache_read_tokens: w.cache_read_input_tokens,
            thinking_tokens: w.reasoning_tokens,
        }
    }
}

/// Convert a raw API response (plus its original JSON) into the
/// provider-facing [`ChatResponse`].
pub fn into_chat_response(
    parsed: ChatCompletionResponse,
    raw_body: &serde_json::Value,
) -> ChatResponse {
    let raw_assistant_content = raw_body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .cloned();

    match parsed.choices.into_iter().next() {
        Some(choice) => ChatResponse {
            content: choice.message.content,
            tool_calls: choice.message.tool_calls.unwrap_or_default(),
            raw_assistant_content,
            usage: parsed.usage.map(Usage::from).unwrap_or_default(),
            finish_reason: choice.finish_reason,
        },
        None => ChatResponse {
            content: None,
            finish_reason: Some("error".to_string()),
            ..Default::default()
        },
    }
}

/// One SSE delta frame in a streaming response.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionChunk {
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkChoice {
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
    /// Reasoning stream from models that expose it.
    #[serde(default)]
    pub reasoning_content: Option<String>,
}

impl ChatCompletionChunk {
    /// Extract the stream fragment, when the frame carries one.
    pub fn as_stream_chunk(&self) -> Option<crate::StreamChunk> {
        let delta = &self.choices.first()?.delta;
        if delta.content.is_none() && delta.reasoning_content.is_none() {
            return None;
        }
        Some(crate::StreamChunk {
            content: delta.content.clone(),
            thinking: delta.reasoning_content.clone(),
        })
    }
}
