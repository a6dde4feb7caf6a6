//! Tool policy: which tools an (agent, provider) pair may see.
//!
//! Filter chain, most general first: global profile → per-agent policy →
//! per-provider overrides → dynamic disables. A tool must pass every stage.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Allow/deny lists. An empty allow list means "everything not denied".
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyRule {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

impl PolicyRule {
    fn permits(&self, tool: &str) -> bool {
        if self.deny.iter().any(|d| d == tool) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|a| a == tool)
    }
}

/// The full policy table.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolPolicy {
    /// Global profile applied to everything.
    pub profile: PolicyRule,
    /// Per-agent restrictions.
    pub agents: HashMap<String, PolicyRule>,
    /// Per-provider overrides (some providers reject certain schemas).
    pub providers: HashMap<String, PolicyRule>,
    /// Dynamically disabled tools (runtime kill switch).
    #[serde(skip)]
    pub disabled: HashSet<String>,
}

impl ToolPolicy {
    /// Whether `tool` is visible to `agent` on `provider`.
    pub fn allows(&self, agent: &str, provider: &str, tool: &str) -> bool {
        if self.disabled.contains(tool) {
            return false;
        }
        if !self.profile.permits(tool) {
            return false;
        }
        if let Some(rule) = self.agents.get(agent) {
            if !rule.permits(tool) {
                return false;
            }
        }
        if let Some(rule) = self.providers.get(provider) {
            if !rule.permits(tool) {
                return false;
            }
        }
        true
    }

    /// Disable a tool at runtime.
    pub fn disable(&mut self, tool: impl Into<String>) {
        self.disabled.insert(tool.into());
    }

    /// Re-enable a dynamically disabled tool.
    pub fn enable(&mut self, tool: &str) {
        self.disabled.remove(tool);
    }
}
