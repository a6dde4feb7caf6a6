//! Session model and persistence.
//!
//! A session is an append-only message log plus scalar metadata, identified
//! by a scoped key (see [`keys`]). The store ([`store::SessionStore`]) caches
//! sessions in memory and persists them as JSONL files with atomic replace.

pub mod keys;
pub mod store;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Message, Usage};

/// A conversation session.
///
/// Invariants maintained by the store:
/// - `messages` is append-only (mutated only via append/truncate/reset)
/// - `compaction_count` is monotonic non-decreasing
/// - `memory_flush_compaction_count <= compaction_count`
/// - `context_window` is set once on first run and never overwritten
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub key: String,
    pub messages: Vec<Message>,
    /// Rolling summary replacing compacted history, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Running token totals across all runs.
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    /// How many times history has been compacted into the summary.
    #[serde(default)]
    pub compaction_count: u32,
    /// Compaction count at which the last pre-compaction memory flush ran.
    #[serde(default)]
    pub memory_flush_compaction_count: u32,
    /// Prompt tokens reported by the most recent provider call, with the
    /// message count at that time. Used to calibrate token estimates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_prompt_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_count: Option<usize>,
    /// Model context window, cached on first run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u64>,
    /// Session key of the run that spawned this session, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spawned_by: Option<String>,
    #[serde(default)]
    pub spawn_depth: u32,
    /// Agent UUID, when the agent registry assigned one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_uuid: Option<String>,
    /// Effective user this session belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Scalar metadata: model, provider, channel, chat_id.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Session {
    /// Create a new empty session.
    pub fn new(key: impl Into<String>) -> Self {
        let now = Utc::now();
        Session {
            key: key.into(),
            messages: Vec::new(),
            summary: None,
            created_at: now,
            updated_at: now,
            input_tokens: 0,
            output_tokens: 0,
            compaction_count: 0,
            memory_flush_compaction_count: 0,
            last_prompt_tokens: None,
            last_message_count: None,
            context_window: None,
            spawned_by: None,
            spawn_depth: 0,
            agent_uuid: None,
            user_id: None,
            metadata: HashMap::new(),
        }
    }

    /// Accumulate usage from one run into the running totals.
    pub fn accumulate(&mut self, usage: &Usage) {
        self.input_tokens += usage.prompt_tokens;
        self.output_tokens += usage.completion_tokens;
    }

    /// Count of user turns in the history.
    pub fn user_turns(&self) -> usize {
        self.messages.iter().filter(|m| m.is_user()).count()
    }
}
