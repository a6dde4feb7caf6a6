//! Agent resolution: which agent owns an inbound conversation.
//!
//! Precedence, highest first:
//! 1. explicit `agentID` on the message,
//! 2. handoff-route override for the (channel, chat),
//! 3. binding table match — peer match beats channel match,
//! 4. the configured default agent.
//!
//! An explicit or routed agent that is not known logs a warning and resolves
//! to `None`; the router drops the message.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use tracing::warn;

use ferrogate_core::config::GatewayConfig;

/// Resolves inbound conversations to agent IDs.
pub struct BindingTable {
    default_agent: String,
    known_agents: HashSet<String>,
    /// (agent, channel, peers) in config order.
    bindings: Vec<(String, String, Vec<String>)>,
    /// `channel|chat` → agent, installed by handoffs.
    routes: RwLock<HashMap<String, String>>,
}

impl BindingTable {
    pub fn new(config: &GatewayConfig) -> Self {
        let mut known_agents: HashSet<String> =
            config.bindings.iter().map(|b| b.agent_id.clone()).collect();
        known_agents.insert(config.default_agent.clone());

        let bindings = config
            .bindings
            .iter()
            .map(|b| (b.agent_id.clone(), b.channel.clone(), b.peers.clone()))
            .collect();

        Self {
            default_agent: config.default_agent.clone(),
            known_agents,
            bindings,
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Register an additional known agent (spawned/managed agents).
    pub fn add_known_agent(&mut self, agent_id: impl Into<String>) {
        self.known_agents.insert(agent_id.into());
    }

    /// Whether an agent ID is known to this gateway.
    pub fn is_known(&self, agent_id: &str) -> bool {
        self.known_agents.contains(agent_id)
    }

    fn route_key(channel: &str, chat_id: &str) -> String {
        format!("{channel}|{chat_id}")
    }

    /// Install a handoff route: future messages in this chat go to `agent`.
    pub fn set_route(&self, channel: &str, chat_id: &str, agent: impl Into<String>) {
        self.routes
            .write()
            .unwrap()
            .insert(Self::route_key(channel, chat_id), agent.into());
    }

    /// Remove a handoff route.
    pub fn clear_route(&self, channel: &str, chat_id: &str) {
        self.routes
            .write()
            .unwrap()
            .remove(&Self::route_key(channel, chat_id));
    }

    /// Resolve the target agent for a conversation. `None` means the message
    /// must be dropped (explicitly addressed to an unknown agent).
    pub fn resolve(
        &self,
        explicit: Option<&str>,
        channel: &str,
        chat_id: &str,
    ) -> Option<String> {
        if let Some(agent) = explicit {
            if self.is_known(agent) {
                return Some(agent.to_string());
            }
            warn!(agent = %agent, "message addressed to unknown agent, dropping");
            return None;
        }

        if let Some(agent) = self
            .routes
            .read()
            .unwrap()
            .get(&Self::route_key(channel, chat_id))
        {
            if self.is_known(agent) {
                return Some(agent.clone());
            }
            warn!(agent = %agent, "handoff route points at unknown agent, ignoring");
        }

        // Peer match beats channel match.
        for (agent, bound_channel, peers) in &self.bindings {
            if bound_channel == channel && peers.iter().any(|p| p == chat_id) {
                return Some(agent.clone());
            }
        }
        for (agent, bound_channel, peers) in &self.bindings {
            if bound_channel == channel && peers.is_empty() {
                return Some(agent.clone());
            }
        }

        Some(self.default_agent.clone())
    }
}
