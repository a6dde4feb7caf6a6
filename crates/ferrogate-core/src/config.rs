//! Configuration schema — typed settings consumed by the core pipeline.
//!
//! JSON on disk uses camelCase keys; Rust uses snake_case, converted via
//! `#[serde(rename_all = "camelCase")]`. Every struct carries defaults so a
//! missing file or section yields a working configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────
// Root
// ─────────────────────────────────────────────

/// Root configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub scheduler: SchedulerConfig,
    pub agent: AgentConfig,
    pub heartbeat: HeartbeatConfig,
}

// ─────────────────────────────────────────────
// Gateway (inbound router)
// ─────────────────────────────────────────────

/// Inbound router settings: dedup, debounce, agent routing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    /// Debounce window for merging message bursts per sender.
    pub debounce_ms: u64,
    /// Dedup entry lifetime.
    pub dedup_ttl_minutes: u64,
    /// Dedup set capacity (LRU eviction beyond this).
    pub dedup_capacity: usize,
    /// Agent that receives messages no binding matches.
    pub default_agent: String,
    /// Bindings routing channels/peers to agents. First match wins within
    /// a precedence class (peer match beats channel match).
    pub bindings: Vec<AgentBinding>,
    /// DM history scope: "perChat" or "main".
    pub dm_scope: String,
    /// Key used for the merged DM scope.
    pub main_key: String,
    /// Channels that support streaming deliveries. Streaming is disabled in
    /// group chats regardless, to prevent interleaving.
    pub streaming_channels: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1000,
            dedup_ttl_minutes: 20,
            dedup_capacity: 5000,
            default_agent: "main".to_string(),
            bindings: Vec::new(),
            dm_scope: "perChat".to_string(),
            main_key: "main".to_string(),
            streaming_channels: Vec::new(),
        }
    }
}

/// Routes inbound messages to an agent.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentBinding {
    /// Agent that owns matching conversations.
    pub agent_id: String,
    /// Channel to match; empty matches any channel.
    #[serde(default)]
    pub channel: String,
    /// Specific chat/peer IDs to match; empty matches any peer on the channel.
    #[serde(default)]
    pub peers: Vec<String>,
}

// ─────────────────────────────────────────────
// Scheduler
// ─────────────────────────────────────────────

/// Per-lane sizing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LaneConfig {
    /// Concurrent jobs the lane executes.
    pub max_concurrent: usize,
    /// Jobs that may wait in the lane queue before submissions are rejected.
    pub queue_capacity: usize,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            queue_capacity: 64,
        }
    }
}

/// Scheduler settings: lanes and per-session concurrency.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    /// Lane table. The canonical lanes are `main`, `subagent`, `delegate`
    /// and `cron`; missing entries fall back to [`LaneConfig::default`].
    pub lanes: HashMap<String, LaneConfig>,
    /// Per-session concurrency for direct chats.
    pub direct_max_concurrent: usize,
    /// Per-session concurrency for group chats.
    pub group_max_concurrent: usize,
    /// Hard ceiling on per-session concurrency regardless of overrides.
    pub session_ceiling: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lanes: HashMap::new(),
            direct_max_concurrent: 1,
            group_max_concurrent: 3,
            session_ceiling: 4,
        }
    }
}

impl SchedulerConfig {
    /// Lane config by name, defaulted when absent.
    pub fn lane(&self, name: &str) -> LaneConfig {
        self.lanes.get(name).cloned().unwrap_or_default()
    }
}

// ─────────────────────────────────────────────
// Agent loop
// ─────────────────────────────────────────────

/// Input guard behaviour on a pattern match.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardAction {
    Off,
    Log,
    #[default]
    Warn,
    Block,
}

/// Input guard rule set.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GuardConfig {
    pub action: GuardAction,
    /// Regex patterns scanned against user content.
    pub patterns: Vec<String>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            action: GuardAction::Warn,
            patterns: Vec::new(),
        }
    }
}

/// Pre-compaction memory flush settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryFlushConfig {
    pub enabled: bool,
    /// Prompt sent for the flush turn.
    pub prompt: String,
}

impl Default for MemoryFlushConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prompt: "Conversation history is about to be condensed. Write down \
                     anything worth keeping to your memory files now."
                .to_string(),
        }
    }
}

/// Summarization (compaction) policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SummarizeConfig {
    /// Compaction never triggers below this message count.
    pub min_messages: usize,
    /// Share of the usable context window history may occupy before
    /// compaction triggers.
    pub max_history_share: f64,
    /// Tokens reserved off the context window for the reply and overhead.
    pub reserve_tokens_floor: u64,
    /// Messages kept verbatim after compaction.
    pub keep_last_messages: usize,
    pub memory_flush: MemoryFlushConfig,
}

impl Default for SummarizeConfig {
    fn default() -> Self {
        Self {
            min_messages: 50,
            max_history_share: 0.75,
            reserve_tokens_floor: 8_000,
            keep_last_messages: 4,
            memory_flush: MemoryFlushConfig::default(),
        }
    }
}

/// Agent loop settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    /// Model identifier passed to the provider.
    pub model: String,
    /// Context window assumed for the model on first run.
    pub context_window: u64,
    /// Max provider-call iterations per run.
    pub max_iterations: usize,
    /// User messages longer than this are truncated with a notice.
    pub max_message_chars: usize,
    /// Default cap on history messages in the prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_limit: Option<usize>,
    pub guard: GuardConfig,
    pub summarize: SummarizeConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "anthropic/claude-sonnet-4-20250514".to_string(),
            context_window: 200_000,
            max_iterations: 20,
            max_message_chars: 32_000,
            history_limit: None,
            guard: GuardConfig::default(),
            summarize: SummarizeConfig::default(),
        }
    }
}

// ─────────────────────────────────────────────
// Heartbeat
// ─────────────────────────────────────────────

/// Periodic heartbeat runs on the cron lane.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub prompt: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: 30 * 60,
            prompt: "Read HEARTBEAT.md in your workspace (if it exists). \
                     Follow any instructions or tasks listed there. \
                     If nothing needs attention, reply with just: HEARTBEAT_OK"
                .to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.gateway.debounce_ms, 1000);
        assert_eq!(config.gateway.dedup_ttl_minutes, 20);
        assert_eq!(config.gateway.dedup_capacity, 5000);
        assert_eq!(config.scheduler.direct_max_concurrent, 1);
        assert_eq!(config.scheduler.group_max_concurrent, 3);
        assert_eq!(config.agent.max_iterations, 20);
        assert_eq!(config.agent.max_message_chars, 32_000);
        assert_eq!(config.agent.summarize.min_messages, 50);
        assert!((config.agent.summarize.max_history_share - 0.75).abs() < f64::EPSILON);
        assert_eq!(config.agent.guard.action, GuardAction::Warn);
        assert!(!config.heartbeat.enabled);
    }

    #[test]
    fn test_camel_case_keys() {
        let json = r#"{
            "gateway": {"debounceMs": 250, "defaultAgent": "ops"},
            "scheduler": {"lanes": {"main": {"maxConcurrent": 8, "queueCapacity": 16}}},
            "agent": {"maxMessageChars": 1000}
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.gateway.debounce_ms, 250);
        assert_eq!(config.gateway.default_agent, "ops");
        assert_eq!(config.scheduler.lane("main").max_concurrent, 8);
        assert_eq!(config.agent.max_message_chars, 1000);
    }

    #[test]
    fn test_unknown_lane_falls_back_to_default() {
        let config = SchedulerConfig::default();
        let lane = config.lane("delegate");
        assert_eq!(lane.max_concurrent, 4);
        assert_eq!(lane.queue_capacity, 64);
    }

    #[test]
    fn test_guard_action_parsing() {
        let action: GuardAction = serde_json::from_str("\"block\"").unwrap();
        assert_eq!(action, GuardAction::Block);
        let action: GuardAction = serde_json::from_str("\"off\"").unwrap();
        assert_eq!(action, GuardAction::Off);
    }
}
