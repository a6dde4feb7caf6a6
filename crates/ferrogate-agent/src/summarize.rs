//! History compaction: summarization trigger, policy and procedure.
//!
//! Compaction replaces old history with a summary plus the last few
//! messages. The policy triggers when the session is long enough *and* the
//! estimated history tokens exceed their share of the usable context
//! window. A per-session mutex guarantees at most one compaction at a time;
//! the adaptive throttle in the scheduler keeps concurrent runs from racing
//! it in the first place.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use ferrogate_core::config::SummarizeConfig;
use ferrogate_core::session::store::SessionStore;
use ferrogate_core::types::Message;
use ferrogate_providers::{ChatRequest, Provider};

/// Crude token estimate for text without a calibration point.
const CHARS_PER_TOKEN: u64 = 4;

/// Estimate a session's history tokens and context window.
///
/// Uses the calibration stored by the last run (`lastPromptTokens` at
/// `lastMessageCount` messages) plus a chars/4 estimate for messages added
/// since; falls back to chars/4 over everything. Returns `None` until the
/// context window is known.
pub fn estimate_session_tokens(store: &SessionStore, session_key: &str) -> Option<(u64, u64)> {
    let context_window = store.get_context_window(session_key)?;
    let history = store.get_history(session_key);

    let estimated = match store.get_last_prompt_tokens(session_key) {
        Some((tokens, at_count)) if at_count <= history.len() => {
            let tail_chars: u64 = history[at_count..]
                .iter()
                .map(|m| message_chars(m))
                .sum();
            tokens + tail_chars / CHARS_PER_TOKEN
        }
        _ => {
            let total_chars: u64 = history.iter().map(message_chars).sum();
            total_chars / CHARS_PER_TOKEN
        }
    };

    Some((estimated, context_window))
}

fn message_chars(msg: &Message) -> u64 {
    let text = match msg {
        Message::System { content } => content.clone(),
        Message::User { content } => content.as_text(),
        Message::Assistant { content, .. } => content.clone().unwrap_or_default(),
        Message::Tool { content, .. } => content.clone(),
    };
    text.chars().count() as u64
}

/// Runs compactions for an agent's sessions.
pub struct Summarizer {
    provider: Arc<dyn Provider>,
    store: Arc<SessionStore>,
    config: SummarizeConfig,
    model: String,
    /// Per-session compaction locks.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Summarizer {
    pub fn new(
        provider: Arc<dyn Provider>,
        store: Arc<SessionStore>,
        config: SummarizeConfig,
        model: String,
    ) -> Self {
        Self {
            provider,
            store,
            config,
            model,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the policy says this session needs compaction.
    pub fn should_summarize(&self, session_key: &str) -> bool {
        let history_len = self.store.get_history(session_key).len();
        if history_len <= self.config.min_messages {
            return false;
        }
        let Some((estimated, context_window)) =
            estimate_session_tokens(&self.store, session_key)
        else {
            return false;
        };
        let usable = context_window.saturating_sub(self.config.reserve_tokens_floor);
        if usable == 0 {
            return true;
        }
        (estimated as f64) > (usable as f64) * self.config.max_history_share
    }

    /// Compact the session if the policy triggers. Returns whether a
    /// compaction ran. Serialized per session; the policy is re-checked
    /// under the lock so a racing run doesn't compact twice.
    pub async fn maybe_summarize(&self, run_id: &str, session_key: &str) -> Result<bool> {
        if !self.should_summarize(session_key) {
            return Ok(false);
        }

        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(session_key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        if !self.should_summarize(session_key) {
            return Ok(false);
        }

        info!(run_id = %run_id, session_key = %session_key, "compacting session history");

        // Pre-compaction memory flush, at most once per compaction.
        if self.config.memory_flush.enabled
            && self.store.get_memory_flush_compaction_count(session_key)
                <= self.store.get_compaction_count(session_key)
        {
            if let Err(e) = self.memory_flush(run_id, session_key).await {
                warn!(session_key = %session_key, error = %e, "memory flush failed, compacting anyway");
            }
        }

        let summary = self.summarize_history(run_id, session_key).await?;

        self.store.set_summary(session_key, summary);
        self.store
            .truncate_history(session_key, self.config.keep_last_messages);
        let count = self.store.increment_compaction(session_key);
        if self.config.memory_flush.enabled {
            self.store.set_memory_flush_done(session_key);
        }
        self.store
            .save(session_key)
            .with_context(|| format!("persisting compacted session {session_key}"))?;

        info!(
            session_key = %session_key,
            compaction_count = count,
            "session compacted"
        );
        Ok(true)
    }

    /// One LLM turn telling the agent to externalise state before the
    /// history disappears. The reply joins the history so the model sees
    /// its own notes after compaction.
    async fn memory_flush(&self, run_id: &str, session_key: &str) -> Result<()> {
        debug!(session_key = %session_key, "running pre-compaction memory flush");
        let mut messages = self.store.get_history(session_key);
        messages.push(Message::user(self.config.memory_flush.prompt.clone()));

        let response = self
            .provider
            .chat(ChatRequest::new(run_id, &self.model, messages))
            .await
            .context("memory flush call")?;

        if let Some(content) = response.content {
            if !content.trim().is_empty() {
                self.store
                    .add_message(session_key, Message::assistant(content));
            }
        }
        Ok(())
    }

    async fn summarize_history(&self, run_id: &str, session_key: &str) -> Result<String> {
        let history = self.store.get_history(session_key);
        let prior_summary = self.store.get_summary(session_key);

        let mut transcript = String::new();
        if let Some(prior) = &prior_summary {
            transcript.push_str("Previous summary:\n");
            transcript.push_str(prior);
            transcript.push_str("\n\n");
        }
        transcript.push_str("Conversation:\n");
        for msg in &history {
            let (role, text) = match msg {
                Message::System { .. } => continue,
                Message::User { content } => ("user", content.as_text()),
                Message::Assistant { content, .. } => {
                    ("assistant", content.clone().unwrap_or_default())
                }
                Message::Tool { content, .. } => ("tool", content.clone()),
            };
            if text.is_empty() {
                continue;
            }
            transcript.push_str(&format!("{role}: {text}\n"));
        }

        let messages = vec![
            Message::system(
                "Condense the conversation below into a compact summary. Keep \
                 decisions, open tasks, user preferences and important facts. \
                 Write plain prose, no headers.",
            ),
            Message::user(transcript),
        ];

        let response = self
            .provider
            .chat(ChatRequest::new(run_id, &self.model, messages))
            .await
            .context("summarization call")?;

        response
            .content
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("summarization produced no content"))
    }
}
