//! Run request/result types — the unit of work flowing through the scheduler
//! into an agent loop.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{MediaArtifact, PeerKind, Usage};

/// Everything an agent loop needs to execute one request/response cycle.
#[derive(Clone, Debug)]
pub struct RunRequest {
    /// Session the run belongs to (`agent:{agentID}:{scopeSuffix}`).
    pub session_key: String,
    /// The user message text.
    pub message: String,
    /// Local paths of attached media.
    pub media: Vec<String>,
    /// Originating channel name.
    pub channel: String,
    /// Chat/conversation identifier within the channel.
    pub chat_id: String,
    /// Direct or group conversation.
    pub peer_kind: PeerKind,
    /// Unique run identifier (UUID v4).
    pub run_id: String,
    /// Effective user for memory/files (group chats coalesce senders).
    pub user_id: String,
    /// Original sender, retained for permission checks.
    pub sender_id: String,
    /// Whether streaming chunk events should be emitted.
    pub stream: bool,
    /// Extra fragment appended to the system prompt (e.g. group awareness).
    pub extra_system_prompt: Option<String>,
    /// Cap on history messages included in the prompt.
    pub history_limit: Option<usize>,
    /// Parent trace to nest under (announce runs).
    pub parent_trace_id: Option<String>,
    /// Root span of the parent run, for span nesting.
    pub parent_span_id: Option<String>,
    /// Display name for the trace.
    pub trace_name: Option<String>,
    /// Free-form trace tags.
    pub trace_tags: HashMap<String, String>,
}

impl RunRequest {
    /// Create a request with a fresh run ID and defaults for the optionals.
    pub fn new(
        session_key: impl Into<String>,
        message: impl Into<String>,
        channel: impl Into<String>,
        chat_id: impl Into<String>,
    ) -> Self {
        let sender = String::new();
        RunRequest {
            session_key: session_key.into(),
            message: message.into(),
            media: Vec::new(),
            channel: channel.into(),
            chat_id: chat_id.into(),
            peer_kind: PeerKind::Direct,
            run_id: uuid::Uuid::new_v4().to_string(),
            user_id: sender.clone(),
            sender_id: sender,
            stream: false,
            extra_system_prompt: None,
            history_limit: None,
            parent_trace_id: None,
            parent_span_id: None,
            trace_name: None,
            trace_tags: HashMap::new(),
        }
    }
}

/// Result of a completed run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    /// Final sanitized assistant text. Empty for silent replies.
    pub content: String,
    /// The run this result belongs to.
    pub run_id: String,
    /// Provider-call iterations consumed.
    pub iterations: usize,
    /// Accumulated token usage across all iterations.
    pub usage: Usage,
    /// Media artifacts produced by tools during the run.
    pub media: Vec<MediaArtifact>,
}

/// Terminal outcome of a scheduled job, delivered exactly once on the job's
/// outcome channel.
pub type Outcome = anyhow::Result<RunResult>;

/// Marker error for cancelled runs. Lives in the error chain so every layer
/// (scheduler, agent loop, router) can recognise cancellation without string
/// matching.
#[derive(Debug, thiserror::Error)]
#[error("run cancelled")]
pub struct RunCancelled;

/// Whether an error chain contains a cancellation marker.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<RunCancelled>().is_some())
}
