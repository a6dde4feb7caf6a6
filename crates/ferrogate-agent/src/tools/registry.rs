//! Tool registry — thread-safe catalogue with policy-filtered definitions
//! and context-aware dispatch.
//!
//! Read-mostly: lookups take a read lock. Dynamic (un)registration takes the
//! write lock and publishes a `tools_invalidated` event so consumers drop
//! cached definition lists.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use ferrogate_core::bus::events::{AgentEvent, EventPublisher};
use ferrogate_core::types::ToolDefinition;

use super::base::{Tool, ToolArgs, ToolInvocation, ToolResult};
use super::policy::ToolPolicy;
use super::scrub::Scrubber;

/// Stores tools keyed by name and dispatches calls.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    policy: RwLock<ToolPolicy>,
    scrubber: Scrubber,
    events: Option<EventPublisher>,
}

impl ToolRegistry {
    /// Create an empty registry with a permissive policy.
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            policy: RwLock::new(ToolPolicy::default()),
            scrubber: Scrubber::new(),
            events: None,
        }
    }

    /// Attach the event publisher used for cache-invalidation events.
    pub fn with_events(mut self, events: EventPublisher) -> Self {
        self.events = Some(events);
        self
    }

    /// Replace the policy table.
    pub fn set_policy(&self, policy: ToolPolicy) {
        *self.policy.write().unwrap() = policy;
        self.invalidate();
    }

    /// Register a tool. Overwrites any previous tool with the same name.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        info!(tool = tool.name(), "registered tool");
        self.tools
            .write()
            .unwrap()
            .insert(tool.name().to_string(), tool);
        self.invalidate();
    }

    /// Unregister a tool by name. Returns the removed tool, if any.
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let removed = self.tools.write().unwrap().remove(name);
        if removed.is_some() {
            info!(tool = name, "unregistered tool");
            self.invalidate();
        }
        removed
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().unwrap().get(name).cloned()
    }

    /// Check if a tool is registered.
    pub fn has(&self, name: &str) -> bool {
        self.tools.read().unwrap().contains_key(name)
    }

    /// Names of all registered tools, sorted for determinism.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Provider-facing definitions visible to `(agent, provider)` under the
    /// current policy, sorted by name.
    pub fn provider_defs(&self, agent: &str, provider: &str) -> Vec<ToolDefinition> {
        let policy = self.policy.read().unwrap();
        let tools = self.tools.read().unwrap();
        let mut defs: Vec<ToolDefinition> = tools
            .values()
            .filter(|t| policy.allows(agent, provider, t.name()))
            .map(|t| t.to_definition())
            .collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    /// Execute a tool with conversation context.
    ///
    /// Never returns an error: unknown tools and execution failures become
    /// error results the model can read and recover from. Output is
    /// credential-scrubbed before it reaches the conversation.
    pub async fn execute_with_context(
        &self,
        name: &str,
        args: ToolArgs,
        ctx: &ToolInvocation,
    ) -> ToolResult {
        let tool = match self.get(name) {
            Some(t) => t,
            None => {
                warn!(tool = name, "tool not found");
                return ToolResult::error(format!("Error: Tool '{name}' not found"));
            }
        };

        match tool.execute(args, ctx).await {
            Ok(output) => ToolResult {
                for_llm: self.scrubber.scrub(&output),
                is_error: false,
                is_async: tool.is_async(),
                ..Default::default()
            },
            Err(e) => {
                warn!(tool = name, error = %e, "tool execution failed");
                ToolResult {
                    for_llm: self.scrubber.scrub(&format!("Error executing {name}: {e}")),
                    is_error: true,
                    is_async: tool.is_async(),
                    ..Default::default()
                }
            }
        }
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.read().unwrap().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.read().unwrap().is_empty()
    }

    fn invalidate(&self) {
        if let Some(events) = &self.events {
            events.publish(AgentEvent::ToolsInvalidated);
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
