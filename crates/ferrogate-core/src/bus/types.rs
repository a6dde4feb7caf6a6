//! Bus event types — messages flowing between channel adapters and the gateway.

use chrono::{DateTime, Utc};

use crate::types::{meta, MediaArtifact, MediaAttachment, Metadata, PeerKind};

/// An inbound message from a channel adapter to the gateway.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    /// Channel name (e.g. "telegram", "discord", "system").
    pub channel: String,
    /// Sender identifier within the channel. System senders use prefixes
    /// (`subagent:`, `delegate:`, `handoff:`, `teammate:`).
    pub sender_id: String,
    /// Chat/conversation identifier.
    pub chat_id: String,
    /// Text content.
    pub content: String,
    /// Direct or group conversation.
    pub peer_kind: PeerKind,
    /// Explicit target agent, if the channel pinned one.
    pub agent_id: Option<String>,
    /// Channel-resolved user identifier (falls back to sender_id).
    pub user_id: Option<String>,
    /// Per-channel cap on history messages.
    pub history_limit: Option<usize>,
    /// When the message was received.
    pub timestamp: DateTime<Utc>,
    /// Attached media.
    pub media: Vec<MediaAttachment>,
    /// Channel-specific metadata (see [`crate::types::meta`] for known keys).
    pub metadata: Metadata,
}

impl InboundMessage {
    /// Create an inbound message with minimal required fields.
    pub fn new(
        channel: impl Into<String>,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        InboundMessage {
            channel: channel.into(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            peer_kind: PeerKind::Direct,
            agent_id: None,
            user_id: None,
            history_limit: None,
            timestamp: Utc::now(),
            media: Vec::new(),
            metadata: Metadata::new(),
        }
    }

    /// Builder-style metadata insertion.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Channel-assigned message ID, when present.
    pub fn message_id(&self) -> Option<&str> {
        self.metadata.get(meta::MESSAGE_ID).map(|s| s.as_str())
    }

    /// Loop-control command (`stop` / `stopall`), when present.
    pub fn command(&self) -> Option<&str> {
        self.metadata.get(meta::COMMAND).map(|s| s.as_str())
    }

    /// Forum topic thread ID, when the chat is a forum.
    pub fn topic_id(&self) -> Option<&str> {
        if self.metadata.get(meta::IS_FORUM).map(|s| s.as_str()) == Some("true") {
            self.metadata
                .get(meta::MESSAGE_THREAD_ID)
                .map(|s| s.as_str())
        } else {
            None
        }
    }

    /// Effective user ID: explicit user_id, else sender_id.
    pub fn effective_user_id(&self) -> &str {
        self.user_id.as_deref().unwrap_or(&self.sender_id)
    }

    /// Whether this message came from the internal system channel.
    pub fn is_system(&self) -> bool {
        self.channel == "system"
    }
}

/// An outbound message from the gateway to a channel adapter.
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    /// Target channel name.
    pub channel: String,
    /// Target chat/conversation identifier.
    pub chat_id: String,
    /// Text content to send. Empty content clears placeholders only.
    pub content: String,
    /// Media artifacts to deliver alongside the text.
    pub media: Vec<MediaArtifact>,
    /// Channel-specific metadata (reply threading, placeholders, voice).
    pub metadata: Metadata,
}

impl OutboundMessage {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        OutboundMessage {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            media: Vec::new(),
            metadata: Metadata::new(),
        }
    }

    /// An empty outbound used to clear channel-side placeholders after
    /// cancellation or a silent reply.
    pub fn empty(channel: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self::new(channel, chat_id, "")
    }

    /// Whether there is nothing to deliver (no text, no media).
    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.media.is_empty()
    }
}
