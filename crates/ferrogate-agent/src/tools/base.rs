//! Tool trait — the interface every callable unit implements.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use ferrogate_core::types::{Metadata, PeerKind, ToolDefinition, Usage};

/// Conversation context handed to each tool execution.
#[derive(Clone, Debug, Default)]
pub struct ToolInvocation {
    pub channel: String,
    pub chat_id: String,
    pub peer_kind: PeerKind,
    pub session_key: String,
    /// Effective user (group-coalesced in group chats).
    pub user_id: String,
    /// Original sender, for permission checks.
    pub sender_id: String,
    /// Pass-through metadata from the inbound message.
    pub metadata: Metadata,
}

/// Parsed tool-call arguments with typed accessors.
///
/// Models emit arguments as a JSON-encoded object string; malformed JSON
/// degrades to an empty argument set so the tool's own validation produces
/// the user-visible error, not a parse failure.
#[derive(Clone, Debug, Default)]
pub struct ToolArgs {
    values: HashMap<String, Value>,
}

impl ToolArgs {
    /// Parse the JSON argument string off a tool call.
    pub fn from_json(arguments: &str) -> Self {
        Self {
            values: serde_json::from_str(arguments).unwrap_or_default(),
        }
    }

    /// Raw value access, for tools with nested argument shapes.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// A required string argument. The error text reaches the model, which
    /// typically retries with the argument filled in.
    pub fn str_required(&self, key: &str) -> anyhow::Result<&str> {
        self.values
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("tool call is missing required argument '{key}'"))
    }

    /// An optional string argument.
    pub fn str_opt(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(|v| v.as_str())
    }

    /// An optional integer argument.
    pub fn int_opt(&self, key: &str) -> Option<i64> {
        self.values.get(key).and_then(|v| v.as_i64())
    }

    /// A boolean flag, absent meaning `false`.
    pub fn flag(&self, key: &str) -> bool {
        self.values
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<HashMap<String, Value>> for ToolArgs {
    fn from(values: HashMap<String, Value>) -> Self {
        Self { values }
    }
}

/// Outcome of one tool execution, as seen by the agent loop.
#[derive(Clone, Debug, Default)]
pub struct ToolResult {
    /// Payload fed back to the model (credential-scrubbed).
    pub for_llm: String,
    /// Errors are non-fatal; the model sees them and may recover.
    pub is_error: bool,
    /// The tool's work continues past this call (e.g. spawn); `for_llm`
    /// holds its placeholder text.
    pub is_async: bool,
    /// Token usage, for tools that call a provider themselves.
    pub usage: Option<Usage>,
    pub provider: Option<String>,
    pub model: Option<String>,
}

impl ToolResult {
    pub fn ok(for_llm: impl Into<String>) -> Self {
        ToolResult {
            for_llm: for_llm.into(),
            ..Default::default()
        }
    }

    pub fn error(for_llm: impl Into<String>) -> Self {
        ToolResult {
            for_llm: for_llm.into(),
            is_error: true,
            ..Default::default()
        }
    }
}

/// Every tool implements this trait.
///
/// The agent loop discovers tools via `name()`, ships their schemas to the
/// provider via `to_definition()`, and dispatches calls through the registry.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name used by the model to call this tool.
    fn name(&self) -> &str;

    /// Description shown to the model.
    fn description(&self) -> &str;

    /// JSON Schema of the parameters:
    /// `{"type": "object", "properties": {...}, "required": [...]}`.
    fn parameters(&self) -> Value;

    /// Whether the tool's work continues after it returns.
    fn is_async(&self) -> bool {
        false
    }

    /// Execute with the given arguments and conversation context.
    ///
    /// On failure, return `Err` — the registry converts it to an error
    /// result the model can read.
    async fn execute(&self, args: ToolArgs, ctx: &ToolInvocation) -> anyhow::Result<String>;

    /// Build the definition sent to the provider.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description(), self.parameters())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_args_from_valid_json() {
        let args = ToolArgs::from_json(r#"{"path": "/tmp/notes.md", "create": true}"#);
        assert_eq!(args.str_required("path").unwrap(), "/tmp/notes.md");
        assert!(args.flag("create"));
        assert!(!args.is_empty());
    }

    #[test]
    fn test_args_from_malformed_json_degrade_to_empty() {
        let args = ToolArgs::from_json("{not json");
        assert!(args.is_empty());
        let err = args.str_required("path").unwrap_err();
        assert!(err.to_string().contains("missing required argument 'path'"));
    }

    #[test]
    fn test_str_required_rejects_wrong_type() {
        let args = ToolArgs::from_json(r#"{"path": 42}"#);
        assert!(args.str_required("path").is_err());
    }

    #[test]
    fn test_optional_accessors() {
        let args = ToolArgs::from_json(r#"{"mode": "markdown", "limit": 5}"#);
        assert_eq!(args.str_opt("mode"), Some("markdown"));
        assert_eq!(args.str_opt("other"), None);
        assert_eq!(args.int_opt("limit"), Some(5));
        assert_eq!(args.int_opt("missing"), None);
        assert!(!args.flag("missing"));
    }

    #[test]
    fn test_raw_get_for_nested_shapes() {
        let args = ToolArgs::from_json(r#"{"filters": {"channel": "telegram"}}"#);
        assert_eq!(
            args.get("filters").and_then(|v| v.get("channel")),
            Some(&json!("telegram"))
        );
    }

    #[test]
    fn test_tool_result_constructors() {
        let ok = ToolResult::ok("fine");
        assert!(!ok.is_error);
        assert_eq!(ok.for_llm, "fine");
        let err = ToolResult::error("bad");
        assert!(err.is_error);
    }

    #[tokio::test]
    async fn test_to_definition_default() {
        struct DummyTool;

        #[async_trait]
        impl Tool for DummyTool {
            fn name(&self) -> &str {
                "dummy"
            }
            fn description(&self) -> &str {
                "A test tool"
            }
            fn parameters(&self) -> Value {
                json!({
                    "type": "object",
                    "properties": { "msg": { "type": "string" } },
                    "required": ["msg"]
                })
            }
            async fn execute(
                &self,
                args: ToolArgs,
                _ctx: &ToolInvocation,
            ) -> anyhow::Result<String> {
                Ok(args.str_opt("msg").unwrap_or("ok").to_string())
            }
        }

        let def = DummyTool.to_definition();
        assert_eq!(def.function.name, "dummy");
        assert_eq!(def.tool_type, "function");
        assert!(!DummyTool.is_async());

        let out = DummyTool
            .execute(ToolArgs::from_json(r#"{"msg": "hello"}"#), &ToolInvocation::default())
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }
}
