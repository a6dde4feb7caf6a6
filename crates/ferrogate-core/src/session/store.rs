//! Session store — in-memory cache with JSONL persistence.
//!
//! File format: `{sessions_dir}/{safe_key}.jsonl`
//! - Line 1: session header (all scalar fields, no messages)
//! - Line 2+: one message per line
//!
//! `save` writes to a temp file in the same directory and renames it over the
//! target, so a crash never leaves a torn file. All mutating operations go
//! through the in-memory cache; `save` is the only disk write. Reads after a
//! write in the same process always observe the write (cache-first).

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::Session;
use crate::types::{Message, Usage};
use crate::utils;

/// Scalar header written as the first line of each session file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionHeader {
    #[serde(rename = "_type")]
    record_type: String,
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    compaction_count: u32,
    #[serde(default)]
    memory_flush_compaction_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_prompt_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_message_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context_window: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    spawned_by: Option<String>,
    #[serde(default)]
    spawn_depth: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    agent_uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl SessionHeader {
    fn from_session(s: &Session) -> Self {
        SessionHeader {
            record_type: "session".to_string(),
            key: s.key.clone(),
            summary: s.summary.clone(),
            created_at: s.created_at,
            updated_at: s.updated_at,
            input_tokens: s.input_tokens,
            output_tokens: s.output_tokens,
            compaction_count: s.compaction_count,
            memory_flush_compaction_count: s.memory_flush_compaction_count,
            last_prompt_tokens: s.last_prompt_tokens,
            last_message_count: s.last_message_count,
            context_window: s.context_window,
            spawned_by: s.spawned_by.clone(),
            spawn_depth: s.spawn_depth,
            agent_uuid: s.agent_uuid.clone(),
            user_id: s.user_id.clone(),
            metadata: s.metadata.clone(),
        }
    }

    fn into_session(self) -> Session {
        let mut s = Session::new(self.key);
        s.summary = self.summary;
        s.created_at = self.created_at;
        s.updated_at = self.updated_at;
        s.input_tokens = self.input_tokens;
        s.output_tokens = self.output_tokens;
        s.compaction_count = self.compaction_count;
        s.memory_flush_compaction_count = self.memory_flush_compaction_count;
        s.last_prompt_tokens = self.last_prompt_tokens;
        s.last_message_count = self.last_message_count;
        s.context_window = self.context_window;
        s.spawned_by = self.spawned_by;
        s.spawn_depth = self.spawn_depth;
        s.agent_uuid = self.agent_uuid;
        s.user_id = self.user_id;
        s.metadata = self.metadata;
        s
    }
}

/// Summary of a session for listing.
#[derive(Clone, Debug)]
pub struct SessionSummary {
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Channel/chat metadata, when the session recorded it.
    pub channel: Option<String>,
    pub chat_id: Option<String>,
    pub path: PathBuf,
}

/// Thread-safe session store. Multiple readers, exclusive writer.
pub struct SessionStore {
    sessions_dir: PathBuf,
    cache: RwLock<HashMap<String, Session>>,
}

impl SessionStore {
    /// Create a store rooted at `sessions_dir` (defaults to
    /// `~/.ferrogate/sessions/`). The directory is created if missing.
    pub fn new(sessions_dir: Option<PathBuf>) -> std::io::Result<Self> {
        let dir = sessions_dir.unwrap_or_else(utils::get_sessions_path);
        std::fs::create_dir_all(&dir)?;
        Ok(SessionStore {
            sessions_dir: dir,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Get an existing session or create a new empty one.
    ///
    /// Cache → disk → fresh, in that order.
    pub fn get_or_create(&self, key: &str) -> Session {
        {
            let cache = self.cache.read().unwrap();
            if let Some(session) = cache.get(key) {
                return session.clone();
            }
        }

        if let Some(session) = self.load_from_disk(key) {
            let mut cache = self.cache.write().unwrap();
            return cache
                .entry(key.to_string())
                .or_insert(session)
                .clone();
        }

        let mut cache = self.cache.write().unwrap();
        cache
            .entry(key.to_string())
            .or_insert_with(|| Session::new(key))
            .clone()
    }

    /// Mutate a session in place under the write lock, loading it first if
    /// needed. All write operations below funnel through here.
    fn with_session_mut<R>(&self, key: &str, f: impl FnOnce(&mut Session) -> R) -> R {
        // Ensure the session is cached (may hit disk outside the write lock).
        let _ = self.get_or_create(key);
        let mut cache = self.cache.write().unwrap();
        let session = cache
            .entry(key.to_string())
            .or_insert_with(|| Session::new(key));
        let result = f(session);
        session.updated_at = Utc::now();
        result
    }

    // ────────────── Messages ──────────────

    /// Append a message. The log is append-only: existing entries are never
    /// rewritten.
    pub fn add_message(&self, key: &str, message: Message) {
        self.with_session_mut(key, |s| s.messages.push(message));
    }

    /// Append a batch of messages in order (a run's pending buffer flush).
    pub fn add_messages(&self, key: &str, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        self.with_session_mut(key, |s| s.messages.extend(messages));
    }

    /// Full message history.
    pub fn get_history(&self, key: &str) -> Vec<Message> {
        self.get_or_create(key).messages
    }

    /// Drop all but the last `keep_last` messages (compaction tail).
    pub fn truncate_history(&self, key: &str, keep_last: usize) {
        self.with_session_mut(key, |s| {
            let len = s.messages.len();
            if len > keep_last {
                s.messages.drain(..len - keep_last);
            }
        });
    }

    // ────────────── Summary & counters ──────────────

    pub fn get_summary(&self, key: &str) -> Option<String> {
        self.get_or_create(key).summary
    }

    pub fn set_summary(&self, key: &str, summary: impl Into<String>) {
        self.with_session_mut(key, |s| s.summary = Some(summary.into()));
    }

    /// Bump the compaction counter, returning the new value.
    pub fn increment_compaction(&self, key: &str) -> u32 {
        self.with_session_mut(key, |s| {
            s.compaction_count += 1;
            s.compaction_count
        })
    }

    pub fn get_compaction_count(&self, key: &str) -> u32 {
        self.get_or_create(key).compaction_count
    }

    pub fn get_memory_flush_compaction_count(&self, key: &str) -> u32 {
        self.get_or_create(key).memory_flush_compaction_count
    }

    /// Record that the pre-compaction memory flush ran at the current
    /// compaction count.
    pub fn set_memory_flush_done(&self, key: &str) {
        self.with_session_mut(key, |s| {
            s.memory_flush_compaction_count = s.compaction_count;
        });
    }

    // ────────────── Token accounting ──────────────

    pub fn accumulate_tokens(&self, key: &str, usage: &Usage) {
        self.with_session_mut(key, |s| s.accumulate(usage));
    }

    /// Cache the model context window. Set once: later calls are ignored.
    pub fn set_context_window(&self, key: &str, context_window: u64) {
        self.with_session_mut(key, |s| {
            if s.context_window.is_none() {
                s.context_window = Some(context_window);
            }
        });
    }

    pub fn get_context_window(&self, key: &str) -> Option<u64> {
        self.get_or_create(key).context_window
    }

    /// Calibration point for the token estimator: prompt tokens reported by
    /// the latest provider call and the message count at that moment.
    pub fn set_last_prompt_tokens(&self, key: &str, tokens: u64, message_count: usize) {
        self.with_session_mut(key, |s| {
            s.last_prompt_tokens = Some(tokens);
            s.last_message_count = Some(message_count);
        });
    }

    pub fn get_last_prompt_tokens(&self, key: &str) -> Option<(u64, usize)> {
        let s = self.get_or_create(key);
        match (s.last_prompt_tokens, s.last_message_count) {
            (Some(t), Some(c)) => Some((t, c)),
            _ => None,
        }
    }

    // ────────────── Metadata ──────────────

    /// Merge scalar metadata entries (model, provider, channel, chat_id).
    pub fn update_metadata<I, K, V>(&self, key: &str, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.with_session_mut(key, |s| {
            for (k, v) in entries {
                s.metadata.insert(k.into(), v.into());
            }
        });
    }

    /// Most recently used (channel, chat_id) pair for an agent, across all of
    /// its sessions. Used to route agent-initiated sends.
    pub fn last_used_channel(&self, agent_id: &str) -> Option<(String, String)> {
        let prefix = format!("agent:{agent_id}:");
        let mut best: Option<(DateTime<Utc>, String, String)> = None;

        let scan = |s: &Session, best: &mut Option<(DateTime<Utc>, String, String)>| {
            if !s.key.starts_with(&prefix) {
                return;
            }
            let (Some(channel), Some(chat)) =
                (s.metadata.get("channel"), s.metadata.get("chat_id"))
            else {
                return;
            };
            if channel == "system" {
                return;
            }
            if best.as_ref().map_or(true, |(t, _, _)| s.updated_at > *t) {
                *best = Some((s.updated_at, channel.clone(), chat.clone()));
            }
        };

        {
            let cache = self.cache.read().unwrap();
            for s in cache.values() {
                scan(s, &mut best);
            }
        }
        // Sessions not in cache: consult disk summaries.
        for summary in self.list() {
            if summary.key.starts_with(&prefix) {
                let in_cache = {
                    let cache = self.cache.read().unwrap();
                    cache.contains_key(&summary.key)
                };
                if !in_cache {
                    let s = self.get_or_create(&summary.key);
                    scan(&s, &mut best);
                }
            }
        }

        best.map(|(_, channel, chat)| (channel, chat))
    }

    // ────────────── Lifecycle ──────────────

    /// Clear history, summary and counters, keeping the key and creation time.
    pub fn reset(&self, key: &str) {
        self.with_session_mut(key, |s| {
            s.messages.clear();
            s.summary = None;
            s.compaction_count = 0;
            s.memory_flush_compaction_count = 0;
            s.last_prompt_tokens = None;
            s.last_message_count = None;
        });
    }

    /// Delete a session from cache and disk. Returns `true` if a file existed.
    pub fn delete(&self, key: &str) -> bool {
        {
            let mut cache = self.cache.write().unwrap();
            cache.remove(key);
        }

        let path = self.session_path(key);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(key = %key, error = %e, "failed to delete session file");
                return false;
            }
            true
        } else {
            false
        }
    }

    /// List all sessions on disk, newest first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut summaries = Vec::new();

        let entries = match std::fs::read_dir(&self.sessions_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "failed to read sessions directory");
                return summaries;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "jsonl") {
                continue;
            }

            if let Ok(file) = std::fs::File::open(&path) {
                let reader = std::io::BufReader::new(file);
                if let Some(Ok(line)) = reader.lines().next() {
                    if let Ok(header) = serde_json::from_str::<SessionHeader>(&line) {
                        summaries.push(SessionSummary {
                            key: header.key.clone(),
                            created_at: header.created_at,
                            updated_at: header.updated_at,
                            channel: header.metadata.get("channel").cloned(),
                            chat_id: header.metadata.get("chat_id").cloned(),
                            path: path.clone(),
                        });
                    }
                }
            }
        }

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries
    }

    /// Paged listing over the same ordering as [`list`](Self::list).
    pub fn list_paged(&self, offset: usize, limit: usize) -> Vec<SessionSummary> {
        self.list().into_iter().skip(offset).take(limit).collect()
    }

    /// Persist one session to disk atomically (temp file + rename).
    pub fn save(&self, key: &str) -> std::io::Result<()> {
        let session = {
            let cache = self.cache.read().unwrap();
            match cache.get(key) {
                Some(s) => s.clone(),
                None => return Ok(()),
            }
        };

        let path = self.session_path(key);
        let tmp = path.with_extension("jsonl.tmp");

        {
            let mut file = std::fs::File::create(&tmp)?;
            let header = SessionHeader::from_session(&session);
            writeln!(file, "{}", serde_json::to_string(&header)?)?;
            for msg in &session.messages {
                writeln!(file, "{}", serde_json::to_string(msg)?)?;
            }
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;

        debug!(
            key = %key,
            messages = session.messages.len(),
            "saved session"
        );
        Ok(())
    }

    // ────────────── Disk helpers ──────────────

    fn session_path(&self, key: &str) -> PathBuf {
        let safe_key = utils::safe_filename(&key.replace(':', "_"));
        self.sessions_dir.join(format!("{safe_key}.jsonl"))
    }

    fn load_from_disk(&self, key: &str) -> Option<Session> {
        let path = self.session_path(key);
        if !path.exists() {
            return None;
        }

        let file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to open session file");
                return None;
            }
        };

        let reader = std::io::BufReader::new(file);
        let mut session: Option<Session> = None;
        let mut messages = Vec::new();

        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => continue,
            };
            if line.trim().is_empty() {
                continue;
            }

            if session.is_none() {
                if let Ok(header) = serde_json::from_str::<SessionHeader>(&line) {
                    if header.record_type == "session" {
                        session = Some(header.into_session());
                        continue;
                    }
                }
            }

            if let Ok(msg) = serde_json::from_str::<Message>(&line) {
                messages.push(msg);
            }
        }

        let mut session = session.unwrap_or_else(|| Session::new(key));
        session.messages = messages;
        debug!(key = %key, messages = session.messages.len(), "loaded session from disk");
        Some(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_store() -> (SessionStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(Some(dir.path().to_path_buf())).unwrap();
        (store, dir)
    }

    #[test]
    fn test_get_or_create_new_session() {
        let (store, _dir) = make_store();
        let s = store.get_or_create("agent:main:telegram:direct:1");
        assert_eq!(s.key, "agent:main:telegram:direct:1");
        assert!(s.messages.is_empty());
    }

    #[test]
    fn test_add_message_append_only() {
        let (store, _dir) = make_store();
        let key = "agent:main:cli:direct:main";
        store.add_message(key, Message::user("one"));
        store.add_message(key, Message::assistant("two"));

        let history = store.get_history(key);
        assert_eq!(history.len(), 2);
        assert!(history[0].is_user());
        assert!(history[1].is_assistant());
    }

    #[test]
    fn test_add_messages_batch_preserves_order() {
        let (store, _dir) = make_store();
        let key = "k";
        store.add_messages(
            key,
            vec![
                Message::user("u"),
                Message::assistant_turn(None, vec![crate::types::ToolCall::new("c1", "t", "{}")], None),
                Message::tool_result("c1", "ok"),
                Message::assistant("done"),
            ],
        );
        let history = store.get_history(key);
        assert_eq!(history.len(), 4);
        assert!(history[0].is_user());
        assert!(history[3].is_assistant());
    }

    #[test]
    fn test_history_is_prefix_extension() {
        let (store, _dir) = make_store();
        let key = "k";
        store.add_message(key, Message::user("a"));
        let before = store.get_history(key);
        store.add_message(key, Message::assistant("b"));
        let after = store.get_history(key);

        assert_eq!(&after[..before.len()], &before[..]);
    }

    #[test]
    fn test_truncate_history() {
        let (store, _dir) = make_store();
        let key = "k";
        for i in 0..10 {
            store.add_message(key, Message::user(format!("m{i}")));
        }
        store.truncate_history(key, 4);
        let history = store.get_history(key);
        assert_eq!(history.len(), 4);
        match &history[0] {
            Message::User { content } => assert_eq!(content.as_text(), "m6"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_truncate_history_shorter_than_keep() {
        let (store, _dir) = make_store();
        store.add_message("k", Message::user("only"));
        store.truncate_history("k", 4);
        assert_eq!(store.get_history("k").len(), 1);
    }

    #[test]
    fn test_summary_and_compaction_counters() {
        let (store, _dir) = make_store();
        let key = "k";
        assert!(store.get_summary(key).is_none());
        store.set_summary(key, "we discussed rust");
        assert_eq!(store.get_summary(key).as_deref(), Some("we discussed rust"));

        assert_eq!(store.get_compaction_count(key), 0);
        assert_eq!(store.increment_compaction(key), 1);
        assert_eq!(store.increment_compaction(key), 2);
        assert_eq!(store.get_compaction_count(key), 2);

        // Memory flush count trails the compaction count.
        assert_eq!(store.get_memory_flush_compaction_count(key), 0);
        store.set_memory_flush_done(key);
        assert_eq!(store.get_memory_flush_compaction_count(key), 2);
        assert!(store.get_memory_flush_compaction_count(key) <= store.get_compaction_count(key));
    }

    #[test]
    fn test_context_window_set_once() {
        let (store, _dir) = make_store();
        store.set_context_window("k", 200_000);
        store.set_context_window("k", 8_000);
        assert_eq!(store.get_context_window("k"), Some(200_000));
    }

    #[test]
    fn test_last_prompt_tokens_calibration() {
        let (store, _dir) = make_store();
        assert!(store.get_last_prompt_tokens("k").is_none());
        store.set_last_prompt_tokens("k", 12_345, 40);
        assert_eq!(store.get_last_prompt_tokens("k"), Some((12_345, 40)));
    }

    #[test]
    fn test_accumulate_tokens() {
        let (store, _dir) = make_store();
        store.accumulate_tokens(
            "k",
            &Usage {
                prompt_tokens: 100,
                completion_tokens: 30,
                ..Default::default()
            },
        );
        let s = store.get_or_create("k");
        assert_eq!(s.input_tokens, 100);
        assert_eq!(s.output_tokens, 30);
    }

    #[test]
    fn test_reset() {
        let (store, _dir) = make_store();
        let key = "k";
        store.add_message(key, Message::user("hello"));
        store.set_summary(key, "sum");
        store.increment_compaction(key);
        store.reset(key);

        let s = store.get_or_create(key);
        assert!(s.messages.is_empty());
        assert!(s.summary.is_none());
        assert_eq!(s.compaction_count, 0);
    }

    #[test]
    fn test_delete() {
        let (store, _dir) = make_store();
        store.add_message("k", Message::user("hello"));
        store.save("k").unwrap();
        assert!(store.delete("k"));
        assert!(!store.delete("k"));
        assert!(store.get_or_create("k").messages.is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let key = "agent:main:telegram:direct:42";

        {
            let store = SessionStore::new(Some(dir.path().to_path_buf())).unwrap();
            store.add_message(key, Message::user("hello"));
            store.add_message(key, Message::assistant("hi there"));
            store.set_summary(key, "greeting");
            store.set_context_window(key, 128_000);
            store.accumulate_tokens(
                key,
                &Usage {
                    prompt_tokens: 11,
                    completion_tokens: 7,
                    ..Default::default()
                },
            );
            store.save(key).unwrap();
        }

        {
            let store = SessionStore::new(Some(dir.path().to_path_buf())).unwrap();
            let s = store.get_or_create(key);
            assert_eq!(s.messages.len(), 2);
            assert_eq!(s.summary.as_deref(), Some("greeting"));
            assert_eq!(s.context_window, Some(128_000));
            assert_eq!(s.input_tokens, 11);
            assert_eq!(s.output_tokens, 7);
        }
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(Some(dir.path().to_path_buf())).unwrap();
        store.add_message("k", Message::user("x"));
        store.save("k").unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().map_or(false, |ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_save_unknown_key_is_noop() {
        let (store, _dir) = make_store();
        store.save("never-created").unwrap();
    }

    #[test]
    fn test_list_sessions_sorted() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(Some(dir.path().to_path_buf())).unwrap();

        for key in ["agent:a:cli:direct:1", "agent:b:cli:direct:2"] {
            store.add_message(key, Message::user("x"));
            store.save(key).unwrap();
        }

        let sessions = store.list();
        assert_eq!(sessions.len(), 2);
        assert!(sessions[0].updated_at >= sessions[1].updated_at);
    }

    #[test]
    fn test_list_paged() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(Some(dir.path().to_path_buf())).unwrap();
        for i in 0..5 {
            let key = format!("agent:a:cli:direct:{i}");
            store.add_message(&key, Message::user("x"));
            store.save(&key).unwrap();
        }
        assert_eq!(store.list_paged(0, 2).len(), 2);
        assert_eq!(store.list_paged(4, 2).len(), 1);
        assert!(store.list_paged(10, 2).is_empty());
    }

    #[test]
    fn test_last_used_channel() {
        let (store, _dir) = make_store();
        let key = "agent:main:telegram:direct:c7";
        store.add_message(key, Message::user("x"));
        store.update_metadata(key, [("channel", "telegram"), ("chat_id", "c7")]);

        assert_eq!(
            store.last_used_channel("main"),
            Some(("telegram".to_string(), "c7".to_string()))
        );
        assert_eq!(store.last_used_channel("other"), None);
    }

    #[test]
    fn test_concurrent_writers_distinct_keys() {
        let (store, _dir) = make_store();
        let store = std::sync::Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let key = format!("agent:a:cli:direct:{i}");
                    for j in 0..20 {
                        store.add_message(&key, Message::user(format!("m{j}")));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for i in 0..8 {
            let key = format!("agent:a:cli:direct:{i}");
            assert_eq!(store.get_history(&key).len(), 20);
        }
    }
}
