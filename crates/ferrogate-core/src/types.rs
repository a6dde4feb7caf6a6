//! Chat message types shared across the workspace.
//!
//! Messages follow the OpenAI chat-completions shape (`role` + `content` +
//! optional tool calls) because that is what providers consume. Assistant
//! messages additionally carry an opaque `raw` payload: the provider-native
//! representation of the turn, preserved verbatim so provider-side prompt
//! caching survives a round-trip through the session store.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ─────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────

/// A chat message, tagged by role.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role")]
pub enum Message {
    #[serde(rename = "system")]
    System { content: String },

    #[serde(rename = "user")]
    User { content: MessageContent },

    #[serde(rename = "assistant")]
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<ToolCall>>,
        /// Provider-native representation of this turn. Opaque: stored and
        /// replayed as-is so provider cache blocks are not invalidated.
        #[serde(skip_serializing_if = "Option::is_none")]
        raw: Option<serde_json::Value>,
    },

    #[serde(rename = "tool")]
    Tool {
        content: String,
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

impl Message {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Message::System {
            content: content.into(),
        }
    }

    /// Create a user message with text content.
    pub fn user(content: impl Into<String>) -> Self {
        Message::User {
            content: MessageContent::Text(content.into()),
        }
    }

    /// Create a user message with multipart content (text + images).
    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Message::User {
            content: MessageContent::Parts(parts),
        }
    }

    /// Create a plain-text assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Message::Assistant {
            content: Some(content.into()),
            tool_calls: None,
            raw: None,
        }
    }

    /// Create an assistant message carrying tool calls and the raw provider payload.
    pub fn assistant_turn(
        content: Option<String>,
        tool_calls: Vec<ToolCall>,
        raw: Option<serde_json::Value>,
    ) -> Self {
        Message::Assistant {
            content,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            raw,
        }
    }

    /// Create a tool result message keyed by the originating call ID.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Message::Tool {
            content: content.into(),
            tool_call_id: tool_call_id.into(),
            is_error: false,
        }
    }

    /// Create a tool error message. Errors are non-fatal: the model sees them
    /// and may recover.
    pub fn tool_error(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Message::Tool {
            content: content.into(),
            tool_call_id: tool_call_id.into(),
            is_error: true,
        }
    }

    /// Whether this is a user message.
    pub fn is_user(&self) -> bool {
        matches!(self, Message::User { .. })
    }

    /// Whether this is an assistant message.
    pub fn is_assistant(&self) -> bool {
        matches!(self, Message::Assistant { .. })
    }
}

/// User message content — plain text or multipart (for vision).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Text of the message; multipart content yields its text parts joined.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// A single part of a multipart message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

/// Image URL payload (plain URL or base64 data URI).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ImageUrl {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

// ─────────────────────────────────────────────
// Tool calls and definitions
// ─────────────────────────────────────────────

/// A tool call requested by the assistant.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Unique ID for this call (matches the later tool result).
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        ToolCall {
            id: id.into(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// Function name plus JSON-encoded arguments.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

/// Schema for a tool, sent to the provider.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        ToolDefinition {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

// ─────────────────────────────────────────────
// Token usage
// ─────────────────────────────────────────────

/// Token usage for one provider call (or accumulated across a run).
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub thinking_tokens: u64,
}

impl Usage {
    /// Accumulate another usage record into this one.
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.thinking_tokens += other.thinking_tokens;
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

// ─────────────────────────────────────────────
// Media
// ─────────────────────────────────────────────

/// A media attachment on an inbound channel message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MediaAttachment {
    /// MIME type (e.g. "image/jpeg", "audio/ogg").
    pub mime_type: String,
    /// Local file path or URL.
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// A media artifact produced by a tool during a run, delivered outbound.
///
/// Tools signal artifacts with `MEDIA:{path}` lines in their result text; a
/// `[[audio_as_voice]]` marker on the preceding line requests voice-note
/// delivery for audio files.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MediaArtifact {
    /// Local path or URL of the artifact.
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub audio_as_voice: bool,
}

// ─────────────────────────────────────────────
// Peer kind
// ─────────────────────────────────────────────

/// Whether a conversation is one-on-one or a group chat.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    #[default]
    Direct,
    Group,
}

impl PeerKind {
    /// Parse a channel-supplied string; empty or unknown falls back to direct.
    pub fn parse(s: &str) -> Self {
        match s {
            "group" => PeerKind::Group,
            _ => PeerKind::Direct,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PeerKind::Direct => "direct",
            PeerKind::Group => "group",
        }
    }
}

impl std::fmt::Display for PeerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known metadata keys used on bus messages.
pub mod meta {
    pub const MESSAGE_ID: &str = "message_id";
    pub const MESSAGE_THREAD_ID: &str = "message_thread_id";
    pub const IS_FORUM: &str = "is_forum";
    pub const GUILD_ID: &str = "guild_id";
    pub const LOCAL_KEY: &str = "local_key";
    pub const PLACEHOLDER_KEY: &str = "placeholder_key";
    pub const PLACEHOLDER_UPDATE: &str = "placeholder_update";
    pub const COMMAND: &str = "command";
    pub const ORIGIN_CHANNEL: &str = "origin_channel";
    pub const ORIGIN_PEER_KIND: &str = "origin_peer_kind";
    pub const PARENT_AGENT: &str = "parent_agent";
    pub const ORIGIN_TRACE_ID: &str = "origin_trace_id";
    pub const ORIGIN_ROOT_SPAN_ID: &str = "origin_root_span_id";
    pub const SUBAGENT_LABEL: &str = "subagent_label";
    pub const TARGET_AGENT: &str = "target_agent";
    pub const DELEGATION_ID: &str = "delegation_id";
    pub const HANDOFF_ID: &str = "handoff_id";
    pub const FROM_AGENT: &str = "from_agent";
    pub const TO_AGENT: &str = "to_agent";
    pub const USER_NAME: &str = "user_name";
    pub const REPLY_TO_MESSAGE_ID: &str = "reply_to_message_id";
    pub const AUDIO_AS_VOICE: &str = "audio_as_voice";
}

/// Convenience alias for string metadata maps on bus messages.
pub type Metadata = HashMap<String, String>;

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
