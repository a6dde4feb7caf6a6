//! End-to-end scenarios over the full pipeline:
//! channel bus → router (dedup/debounce) → scheduler → agent loop →
//! provider/tools → session store → outbound bus.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use ferrogate_agent::tools::{Tool, ToolArgs, ToolInvocation, ToolRegistry};
use ferrogate_agent::AgentLoop;
use ferrogate_core::bus::events::EventPublisher;
use ferrogate_core::bus::queue::MessageBus;
use ferrogate_core::bus::types::{InboundMessage, OutboundMessage};
use ferrogate_core::config::Config;
use ferrogate_core::session::store::SessionStore;
use ferrogate_core::types::{meta, Message, PeerKind, ToolCall};
use ferrogate_gateway::binding::BindingTable;
use ferrogate_gateway::InboundRouter;
use ferrogate_providers::testing::ScriptedProvider;
use ferrogate_providers::{ChatRequest, ChatResponse, Provider, ProviderError};
use ferrogate_scheduler::Scheduler;
use ferrogate_trace::{MemoryCollector, TraceStatus};

struct Pipeline {
    bus: Arc<MessageBus>,
    store: Arc<SessionStore>,
    collector: Arc<MemoryCollector>,
    scheduler: Arc<Scheduler>,
    shutdown: CancellationToken,
    _dir: tempfile::TempDir,
}

/// Wire the whole stack around the given provider and tools.
fn pipeline_with(
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    mut config: Config,
) -> Pipeline {
    config.gateway.debounce_ms = config.gateway.debounce_ms.min(100);

    let dir = tempdir().unwrap();
    let bus = Arc::new(MessageBus::new(64));
    let store = Arc::new(SessionStore::new(Some(dir.path().join("sessions"))).unwrap());
    let collector = Arc::new(MemoryCollector::default());
    let scheduler = Scheduler::new(config.scheduler.clone());

    let agent = Arc::new(AgentLoop::new(
        "main",
        provider,
        store.clone(),
        tools,
        collector.clone(),
        EventPublisher::default(),
        config.agent.clone(),
        dir.path().join("workspace"),
    ));
    {
        let agent = agent.clone();
        scheduler.set_runner(Arc::new(move |cancel, req| {
            let agent = agent.clone();
            Box::pin(async move { agent.run(cancel, req).await })
        }));
    }

    let bindings = BindingTable::new(&config.gateway);
    let router = Arc::new(InboundRouter::new(
        bus.clone(),
        scheduler.clone(),
        store.clone(),
        config,
        bindings,
    ));
    let shutdown = CancellationToken::new();
    {
        let router = router.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { router.run(shutdown).await });
    }

    Pipeline {
        bus,
        store,
        collector,
        scheduler,
        shutdown,
        _dir: dir,
    }
}

fn fast_config() -> Config {
    let mut config = Config::default();
    config.gateway.debounce_ms = 50;
    config
}

async fn recv_outbound(bus: &MessageBus) -> OutboundMessage {
    tokio::time::timeout(Duration::from_secs(5), bus.consume_outbound())
        .await
        .expect("outbound within timeout")
        .expect("bus open")
}

fn dm(sender: &str, chat: &str, content: &str, message_id: &str) -> InboundMessage {
    InboundMessage::new("telegram", sender, chat, content)
        .with_meta(meta::MESSAGE_ID, message_id)
}

// ─────────────────────────────────────────────
// Scenario 1: single DM
// ─────────────────────────────────────────────

#[tokio::test]
async fn scenario_single_dm() {
    let p = pipeline_with(
        Arc::new(ScriptedProvider::simple("Hello u1!")),
        Arc::new(ToolRegistry::new()),
        fast_config(),
    );

    p.bus
        .publish_inbound(dm("u1", "c1", "hi", "m1"))
        .await
        .unwrap();

    let out = recv_outbound(&p.bus).await;
    assert_eq!(out.channel, "telegram");
    assert_eq!(out.chat_id, "c1");
    assert_eq!(out.content, "Hello u1!");
    assert_eq!(
        out.metadata.get(meta::REPLY_TO_MESSAGE_ID).map(|s| s.as_str()),
        Some("m1")
    );

    let history = p.store.get_history("agent:main:telegram:direct:c1");
    assert_eq!(history.len(), 2);

    let traces = p.collector.traces();
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].status, TraceStatus::Completed);
    p.shutdown.cancel();
}

// ─────────────────────────────────────────────
// Scenario 2: duplicate suppression
// ─────────────────────────────────────────────

#[tokio::test]
async fn scenario_duplicate_suppression() {
    let p = pipeline_with(
        Arc::new(ScriptedProvider::simple("once")),
        Arc::new(ToolRegistry::new()),
        fast_config(),
    );

    p.bus
        .publish_inbound(dm("u1", "c1", "hi", "m1"))
        .await
        .unwrap();
    p.bus
        .publish_inbound(dm("u1", "c1", "hi", "m1"))
        .await
        .unwrap();

    let _ = recv_outbound(&p.bus).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Exactly one run: one trace, one user+assistant pair.
    assert_eq!(p.collector.traces().len(), 1);
    assert_eq!(p.store.get_history("agent:main:telegram:direct:c1").len(), 2);
    p.shutdown.cancel();
}

// ─────────────────────────────────────────────
// Scenario 3: debounce merge
// ─────────────────────────────────────────────

#[tokio::test]
async fn scenario_debounce_merge() {
    let mut config = fast_config();
    config.gateway.debounce_ms = 100;
    let p = pipeline_with(
        Arc::new(ScriptedProvider::simple("merged!")),
        Arc::new(ToolRegistry::new()),
        config,
    );

    for (i, content) in ["a", "b", "c"].iter().enumerate() {
        p.bus
            .publish_inbound(dm("u1", "c1", content, &format!("m{i}")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let _ = recv_outbound(&p.bus).await;

    let history = p.store.get_history("agent:main:telegram:direct:c1");
    assert_eq!(history.len(), 2);
    match &history[0] {
        Message::User { content } => assert_eq!(content.as_text(), "a\nb\nc"),
        other => panic!("expected merged user message, got {other:?}"),
    }
    assert_eq!(p.collector.traces().len(), 1);
    p.shutdown.cancel();
}

// ─────────────────────────────────────────────
// Scenario 4: /stop during a tool call
// ─────────────────────────────────────────────

struct StuckTool;

#[async_trait]
impl Tool for StuckTool {
    fn name(&self) -> &str {
        "long_task"
    }
    fn description(&self) -> &str {
        "takes forever"
    }
    fn parameters(&self) -> serde_json::Value {
        json!({"type": "object", "properties": {}, "required": []})
    }
    async fn execute(&self, _args: ToolArgs, _ctx: &ToolInvocation) -> anyhow::Result<String> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok("done".into())
    }
}

#[tokio::test]
async fn scenario_stop_during_tool_call() {
    let tools = Arc::new(ToolRegistry::new());
    tools.register(Arc::new(StuckTool));
    let provider = ScriptedProvider::new(vec![ChatResponse {
        tool_calls: vec![ToolCall::new("c1", "long_task", "{}")],
        ..Default::default()
    }]);
    let p = pipeline_with(Arc::new(provider), tools, fast_config());

    p.bus
        .publish_inbound(dm("u1", "c1", "do the long thing", "m1"))
        .await
        .unwrap();
    // Debounce closes, the run starts and blocks inside the tool.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stop = InboundMessage::new("telegram", "u1", "c1", "/stop")
        .with_meta(meta::COMMAND, "stop");
    p.bus.publish_inbound(stop).await.unwrap();

    // Confirmation plus the cancelled run's empty outbound, either order.
    let first = recv_outbound(&p.bus).await;
    let second = recv_outbound(&p.bus).await;
    let contents = [first.content.as_str(), second.content.as_str()];
    assert!(contents.contains(&"Task stopped."));
    assert!(contents.contains(&""));

    // Cancellation appended nothing.
    assert!(p.store.get_history("agent:main:telegram:direct:c1").is_empty());

    let traces = p.collector.traces();
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].status, TraceStatus::Cancelled);
    p.shutdown.cancel();
}

// ─────────────────────────────────────────────
// Scenario 5: group concurrency
// ─────────────────────────────────────────────

/// Echoes the sender's text after a delay, tracking concurrency.
struct SlowEchoProvider {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl SlowEchoProvider {
    fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Provider for SlowEchoProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);

        let last = req
            .messages
            .iter()
            .rev()
            .find_map(|m| match m {
                Message::User { content } => Some(content.as_text()),
                _ => None,
            })
            .unwrap_or_default();
        Ok(ChatResponse {
            content: Some(format!("re: {last}")),
            ..Default::default()
        })
    }
    fn default_model(&self) -> &str {
        "slow-echo"
    }
    fn display_name(&self) -> &str {
        "SlowEchoProvider"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_group_concurrency() {
    let provider = Arc::new(SlowEchoProvider::new());
    let p = pipeline_with(
        provider.clone(),
        Arc::new(ToolRegistry::new()),
        fast_config(),
    );

    for (sender, text, mid) in [("u1", "first question", "m1"), ("u2", "second question", "m2")] {
        let mut msg = InboundMessage::new("discord", sender, "g1", text)
            .with_meta(meta::MESSAGE_ID, mid);
        msg.peer_kind = PeerKind::Group;
        p.bus.publish_inbound(msg).await.unwrap();
    }

    let _ = recv_outbound(&p.bus).await;
    let _ = recv_outbound(&p.bus).await;

    // Both runs were admitted in parallel (group session max is 3).
    assert!(
        provider.peak.load(Ordering::SeqCst) >= 2,
        "group runs should overlap"
    );

    // Per-run buffering keeps each question/answer pair contiguous.
    let history = p.store.get_history("agent:main:discord:group:g1");
    assert_eq!(history.len(), 4);
    for pair in history.chunks(2) {
        let question = match &pair[0] {
            Message::User { content } => content.as_text(),
            other => panic!("expected user message, got {other:?}"),
        };
        match &pair[1] {
            Message::Assistant { content, .. } => {
                assert_eq!(content.as_deref(), Some(format!("re: {question}").as_str()));
            }
            other => panic!("expected assistant message, got {other:?}"),
        }
    }
    p.shutdown.cancel();
}

// ─────────────────────────────────────────────
// Scenario 6: loop detection
// ─────────────────────────────────────────────

struct SameFileTool;

#[async_trait]
impl Tool for SameFileTool {
    fn name(&self) -> &str {
        "read_file"
    }
    fn description(&self) -> &str {
        "reads a file"
    }
    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        })
    }
    async fn execute(&self, args: ToolArgs, _ctx: &ToolInvocation) -> anyhow::Result<String> {
        let _ = args.str_required("path")?;
        Ok("identical file contents".into())
    }
}

#[tokio::test]
async fn scenario_loop_detection() {
    let tools = Arc::new(ToolRegistry::new());
    tools.register(Arc::new(SameFileTool));

    // The model never stops asking for the same file.
    let responses: Vec<ChatResponse> = (0..8)
        .map(|_| ChatResponse {
            tool_calls: vec![ToolCall::new(
                "cx",
                "read_file",
                r#"{"path":"same.txt"}"#,
            )],
            ..Default::default()
        })
        .collect();
    let p = pipeline_with(
        Arc::new(ScriptedProvider::new(responses)),
        tools,
        fast_config(),
    );

    p.bus
        .publish_inbound(dm("u1", "c1", "read same.txt please", "m1"))
        .await
        .unwrap();

    let out = recv_outbound(&p.bus).await;
    assert_eq!(
        out.content,
        "I was unable to complete this task — I got stuck repeatedly calling \
         read_file without making progress. Please try rephrasing your request."
    );

    let traces = p.collector.traces();
    assert_eq!(traces[0].status, TraceStatus::Completed);

    // The run persisted: user turn, assistant/tool iterations, final reply.
    let history = p.store.get_history("agent:main:telegram:direct:c1");
    assert!(history.len() >= 3);
    assert!(matches!(history.last(), Some(Message::Assistant { .. })));
    p.shutdown.cancel();
}

// ─────────────────────────────────────────────
// Announce run: subagent result nests under the parent run
// ─────────────────────────────────────────────

#[tokio::test]
async fn scenario_subagent_announce_nests_under_parent() {
    let p = pipeline_with(
        Arc::new(ScriptedProvider::new(vec![
            ChatResponse {
                content: Some("Started the research task.".into()),
                ..Default::default()
            },
            ChatResponse {
                content: Some("The subagent found 3 papers.".into()),
                ..Default::default()
            },
        ])),
        Arc::new(ToolRegistry::new()),
        fast_config(),
    );

    // The originating user run.
    p.bus
        .publish_inbound(dm("u1", "c1", "research this", "m1"))
        .await
        .unwrap();
    let _ = recv_outbound(&p.bus).await;

    let parent = p.collector.traces()[0].clone();
    let parent_root_span = p
        .collector
        .spans()
        .into_iter()
        .find(|s| s.trace_id == parent.id && s.parent_span_id.is_none())
        .expect("parent agent span");

    // The subagent finishes and announces into the parent conversation.
    let origin = ferrogate_gateway::announce::Origin::new(
        "telegram",
        "c1",
        PeerKind::Direct,
        "main",
    )
    .with_trace(&parent.id, &parent_root_span.id);
    let announce =
        ferrogate_gateway::announce::subagent_result(&origin, "ab12", "research", "3 papers found");
    p.bus.publish_inbound(announce).await.unwrap();

    let out = recv_outbound(&p.bus).await;
    assert_eq!(out.channel, "telegram");
    assert_eq!(out.content, "The subagent found 3 papers.");

    // Both runs share the parent session; the announce trace links back.
    let history = p.store.get_history("agent:main:telegram:direct:c1");
    assert_eq!(history.len(), 4);

    let traces = p.collector.traces();
    assert_eq!(traces.len(), 2);
    let announce_trace = traces
        .iter()
        .find(|t| t.id != parent.id)
        .expect("announce trace");
    assert_eq!(announce_trace.parent_trace_id.as_deref(), Some(parent.id.as_str()));
    assert_eq!(announce_trace.name, "research");
    assert_eq!(announce_trace.status, TraceStatus::Completed);

    // Its agent span hangs off the parent run's root span.
    let announce_span = p
        .collector
        .spans()
        .into_iter()
        .find(|s| s.trace_id == announce_trace.id && s.name == "research")
        .expect("announce agent span");
    assert_eq!(
        announce_span.parent_span_id.as_deref(),
        Some(parent_root_span.id.as_str())
    );
    p.shutdown.cancel();
}

// ─────────────────────────────────────────────
// Idempotence of scheduling after shutdown
// ─────────────────────────────────────────────

#[tokio::test]
async fn scheduler_stop_rejects_new_work() {
    let p = pipeline_with(
        Arc::new(ScriptedProvider::simple("late")),
        Arc::new(ToolRegistry::new()),
        fast_config(),
    );

    p.scheduler.stop().await;
    p.bus
        .publish_inbound(dm("u1", "c1", "too late", "m1"))
        .await
        .unwrap();

    let out = recv_outbound(&p.bus).await;
    assert!(out.content.starts_with("I encountered an error:"));
    p.shutdown.cancel();
}
