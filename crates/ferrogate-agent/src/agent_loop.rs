//! The agent loop: one `run()` per RunRequest.
//!
//! A run assembles the prompt from the session store, iterates provider
//! calls interleaved with tool execution, detects tool loops, sanitizes the
//! reply and persists the session. All messages produced during the run go
//! into a local pending buffer and reach the store only on success, in one
//! batch — concurrent runs on the same session never observe each other's
//! in-progress state, and a failed or cancelled run leaves no trace in
//! history.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ferrogate_core::bus::events::{AgentEvent, EventPublisher, RunStatus};
use ferrogate_core::config::AgentConfig;
use ferrogate_core::run::{RunCancelled, RunRequest, RunResult};
use ferrogate_core::session::store::SessionStore;
use ferrogate_core::types::{MediaArtifact, Message, ToolCall, Usage};
use ferrogate_core::utils::truncate_string;
use ferrogate_providers::{ChatRequest, Provider, ProviderError, StreamChunk};
use ferrogate_trace::{Span, SpanStatus, SpanType, Trace, TraceCollector, TraceStatus};

use crate::context::ContextBuilder;
use crate::guard::{truncate_message, InputGuard};
use crate::loop_detect::{
    args_hash, change_strategy_message, critical_abort_message, result_digest, LoopDetector,
    LoopVerdict,
};
use crate::media::{extract_artifacts, strip_media_lines};
use crate::sanitize::{is_silent, sanitize_reply};
use crate::summarize::Summarizer;
use crate::tools::{ToolArgs, ToolInvocation, ToolRegistry, ToolResult};

/// Fallback reply when the iteration budget runs out without a final answer.
const EXHAUSTED_FALLBACK: &str = "I've completed processing but have no response to give.";

/// Preview length captured on spans in verbose mode.
const PREVIEW_CHARS: usize = 500;

/// Per-user seeding callback (managed mode), run once per user in-process.
pub type SeedUserFn = Arc<
    dyn Fn(String, PathBuf) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync,
>;

/// One agent's loop. Concurrency-safe: a single instance serves many
/// concurrent runs on distinct session keys.
pub struct AgentLoop {
    agent_id: String,
    provider: Arc<dyn Provider>,
    store: Arc<SessionStore>,
    tools: Arc<ToolRegistry>,
    collector: Arc<dyn TraceCollector>,
    events: EventPublisher,
    config: AgentConfig,
    guard: InputGuard,
    context: ContextBuilder,
    summarizer: Summarizer,
    model: String,
    on_seed_user: Option<SeedUserFn>,
    seed_latches: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<bool>>>>,
}

impl AgentLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_id: impl Into<String>,
        provider: Arc<dyn Provider>,
        store: Arc<SessionStore>,
        tools: Arc<ToolRegistry>,
        collector: Arc<dyn TraceCollector>,
        events: EventPublisher,
        config: AgentConfig,
        workspace: PathBuf,
    ) -> Self {
        let agent_id = agent_id.into();
        let model = if config.model.is_empty() {
            provider.default_model().to_string()
        } else {
            config.model.clone()
        };
        let guard = InputGuard::new(&config.guard);
        let context = ContextBuilder::new(&workspace, &agent_id);
        let summarizer = Summarizer::new(
            provider.clone(),
            store.clone(),
            config.summarize.clone(),
            model.clone(),
        );

        info!(
            agent = %agent_id,
            model = %model,
            max_iterations = config.max_iterations,
            "agent loop initialized"
        );

        Self {
            agent_id,
            provider,
            store,
            tools,
            collector,
            events,
            config,
            guard,
            context,
            summarizer,
            model,
            on_seed_user: None,
            seed_latches: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Install the once-per-user seeding callback.
    pub fn with_seed_callback(mut self, seed: SeedUserFn) -> Self {
        self.on_seed_user = Some(seed);
        self
    }

    /// The model this loop calls.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Execute one run. The trace is finished with the matching terminal
    /// status on every path, including cancellation.
    pub async fn run(&self, cancel: CancellationToken, req: RunRequest) -> Result<RunResult> {
        let trace_name = req
            .trace_name
            .clone()
            .unwrap_or_else(|| "agent_run".to_string());

        let mut trace = Trace::start(&req.run_id, &req.session_key, &trace_name);
        trace.user_id = Some(req.user_id.clone());
        trace.channel = Some(req.channel.clone());
        trace.parent_trace_id = req.parent_trace_id.clone();
        let trace_id = trace.id.clone();
        self.collector.create_trace(trace).await;

        let agent_span = Span::start(
            &trace_id,
            SpanType::Agent,
            &trace_name,
            req.parent_span_id.clone(),
        );
        let agent_span_id = agent_span.id.clone();

        self.events.publish(AgentEvent::RunStarted {
            run_id: req.run_id.clone(),
            session_key: req.session_key.clone(),
        });

        let result = self
            .run_inner(&cancel, &req, &trace_id, &agent_span_id)
            .await;

        let status = match &result {
            Ok(_) => RunStatus::Completed,
            Err(e) if ferrogate_core::run::is_cancelled(e) => RunStatus::Cancelled,
            Err(_) => RunStatus::Error,
        };
        match status {
            RunStatus::Completed => {
                self.collector
                    .emit_span(agent_span.finish(SpanStatus::Ok))
                    .await;
                self.collector
                    .finish_trace(&trace_id, TraceStatus::Completed)
                    .await;
            }
            RunStatus::Cancelled => {
                self.collector
                    .emit_span(agent_span.finish_error("run cancelled"))
                    .await;
                self.collector
                    .finish_trace(&trace_id, TraceStatus::Cancelled)
                    .await;
            }
            RunStatus::Error => {
                let msg = result.as_ref().err().map(|e| e.to_string()).unwrap_or_default();
                self.collector.emit_span(agent_span.finish_error(msg)).await;
                self.collector
                    .finish_trace(&trace_id, TraceStatus::Error)
                    .await;
            }
        }
        self.events.publish(AgentEvent::RunFinished {
            run_id: req.run_id.clone(),
            session_key: req.session_key.clone(),
            status,
        });

        result
    }

    async fn run_inner(
        &self,
        cancel: &CancellationToken,
        req: &RunRequest,
        trace_id: &str,
        agent_span_id: &str,
    ) -> Result<RunResult> {
        let session_key = &req.session_key;
        let provider_name = self.provider.display_name().to_string();

        // First-chat seeding, once per user in-process.
        self.seed_user_once(&req.user_id).await;

        // Input guard and over-length truncation.
        self.guard
            .check(&req.message)
            .with_context(|| format!("input rejected for run {}", req.run_id))?;
        let user_text = truncate_message(&req.message, self.config.max_message_chars);

        // Cache the context window on first run; later calls are no-ops.
        let window = self
            .provider
            .context_window(&self.model)
            .unwrap_or(self.config.context_window);
        self.store.set_context_window(session_key, window);

        // History assembly.
        let history = self.store.get_history(session_key);
        let summary = self.store.get_summary(session_key);
        let history_limit = req.history_limit.or(self.config.history_limit);
        let assembled = self.context.build_messages(
            &history,
            history_limit,
            summary.as_deref(),
            &user_text,
            &req.media,
            &req.user_id,
            &req.channel,
            &req.chat_id,
            req.peer_kind,
            req.extra_system_prompt.as_deref(),
        );
        let mut messages = assembled.messages;

        // Everything generated by this run stays local until the final flush.
        let mut pending: Vec<Message> = vec![Message::user(&user_text)];
        let mut artifacts: Vec<MediaArtifact> = Vec::new();
        let mut usage_total = Usage::default();
        let mut last_prompt_tokens: Option<u64> = None;
        let mut final_content: Option<String> = None;
        let mut final_raw: Option<serde_json::Value> = None;
        let mut detector = LoopDetector::new();
        let mut iterations = 0;

        'iterate: for iteration in 0..self.config.max_iterations {
            iterations = iteration + 1;
            debug!(run_id = %req.run_id, iteration = iteration, "provider call");

            let response = self
                .call_provider(cancel, req, &messages, trace_id, agent_span_id, iteration)
                .await?;

            usage_total.add(&response.usage);
            last_prompt_tokens = Some(response.usage.prompt_tokens);

            if !response.has_tool_calls() {
                final_content = response.content;
                final_raw = response.raw_assistant_content;
                break;
            }

            let assistant = Message::assistant_turn(
                response.content.clone(),
                response.tool_calls.clone(),
                response.raw_assistant_content.clone(),
            );
            messages.push(assistant.clone());
            pending.push(assistant);

            let outcomes = self
                .execute_tool_calls(cancel, req, &response.tool_calls, trace_id, agent_span_id)
                .await?;

            for (call, result) in outcomes {
                self.events.publish(AgentEvent::ToolResult {
                    run_id: req.run_id.clone(),
                    session_key: session_key.clone(),
                    tool: call.function.name.clone(),
                    is_error: result.is_error,
                    preview: truncate_string(&result.for_llm, 200),
                });

                artifacts.extend(extract_artifacts(&result.for_llm));

                let msg = if result.is_error {
                    Message::tool_error(&call.id, &result.for_llm)
                } else {
                    Message::tool_result(&call.id, &result.for_llm)
                };
                messages.push(msg.clone());
                pending.push(msg);

                let verdict = detector.record(
                    &call.function.name,
                    &args_hash(&call.function.arguments),
                    &result_digest(&result.for_llm),
                );
                match verdict {
                    LoopVerdict::Ok => {}
                    LoopVerdict::Warning { tool } => {
                        warn!(run_id = %req.run_id, tool = %tool, "tool loop warning, nudging model");
                        // In-flight only: the nudge is never persisted.
                        messages.push(Message::user(change_strategy_message(&tool)));
                    }
                    LoopVerdict::Critical { tool } => {
                        warn!(run_id = %req.run_id, tool = %tool, "tool loop critical, aborting iteration");
                        final_content = Some(critical_abort_message(&tool));
                        break 'iterate;
                    }
                }
            }
        }

        let content = final_content.unwrap_or_else(|| EXHAUSTED_FALLBACK.to_string());

        // Reply sanitation: artifacts out, control markers stripped.
        artifacts.extend(extract_artifacts(&content));
        let sanitized = sanitize_reply(&strip_media_lines(&content));
        let silent = is_silent(&sanitized);
        if silent {
            debug!(run_id = %req.run_id, "silent reply, suppressing delivery");
        }

        // The final assistant message is persisted even for silent replies,
        // so the model keeps its own context.
        pending.push(Message::assistant_turn(Some(content), Vec::new(), final_raw));

        // Flush the pending buffer and the scalar updates, then save.
        self.store.add_messages(session_key, pending);
        self.store.update_metadata(
            session_key,
            [
                ("model", self.model.as_str()),
                ("provider", provider_name.as_str()),
                ("channel", req.channel.as_str()),
                ("chat_id", req.chat_id.as_str()),
            ],
        );
        self.store.accumulate_tokens(session_key, &usage_total);
        if let Some(prompt_tokens) = last_prompt_tokens {
            let count = self.store.get_history(session_key).len();
            self.store
                .set_last_prompt_tokens(session_key, prompt_tokens, count);
        }
        if let Err(e) = self.store.save(session_key) {
            // Storage failures don't fail the run; the next run may observe
            // partial state.
            warn!(session_key = %session_key, error = %e, "session persistence failed");
        }

        // Bootstrap auto-cleanup after the first few real exchanges.
        if assembled.has_bootstrap && history.iter().filter(|m| m.is_user()).count() + 1 >= 3 {
            if let Err(e) = self.context.remove_bootstrap(&req.user_id) {
                warn!(error = %e, "bootstrap cleanup failed");
            } else {
                info!(session_key = %session_key, "bootstrap file removed");
            }
        }

        if let Err(e) = self.summarizer.maybe_summarize(&req.run_id, session_key).await {
            warn!(session_key = %session_key, error = %e, "summarization failed");
        }

        Ok(RunResult {
            content: if silent { String::new() } else { sanitized },
            run_id: req.run_id.clone(),
            iterations,
            usage: usage_total,
            media: artifacts,
        })
    }

    /// One provider call with streaming fan-out, cancellation and an
    /// `llm_call` span.
    async fn call_provider(
        &self,
        cancel: &CancellationToken,
        req: &RunRequest,
        messages: &[Message],
        trace_id: &str,
        agent_span_id: &str,
        iteration: usize,
    ) -> Result<ferrogate_providers::ChatResponse> {
        let mut chat_req = ChatRequest::new(&req.run_id, &self.model, messages.to_vec());
        chat_req.tools = self
            .tools
            .provider_defs(&self.agent_id, self.provider.display_name());

        let mut span = Span::start(
            trace_id,
            SpanType::LlmCall,
            "llm_call",
            Some(agent_span_id.to_string()),
        );
        if self.collector.verbose() {
            span.input_preview = messages.last().map(|m| preview_message(m));
        }

        let call = async {
            if req.stream {
                let events = self.events.clone();
                let run_id = req.run_id.clone();
                let session_key = req.session_key.clone();
                let sink = move |chunk: StreamChunk| {
                    if let Some(content) = chunk.content {
                        events.publish(AgentEvent::Chunk {
                            run_id: run_id.clone(),
                            session_key: session_key.clone(),
                            content,
                        });
                    }
                    if let Some(thinking) = chunk.thinking {
                        events.publish(AgentEvent::Thinking {
                            run_id: run_id.clone(),
                            session_key: session_key.clone(),
                            content: thinking,
                        });
                    }
                };
                self.provider.chat_stream(chat_req, &sink).await
            } else {
                self.provider.chat(chat_req).await
            }
        };

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                self.collector.emit_span(span.finish_error("run cancelled")).await;
                return Err(anyhow::Error::new(RunCancelled));
            }
            response = call => response,
        };

        match response {
            Ok(response) => {
                span.input_tokens = response.usage.prompt_tokens;
                span.output_tokens = response.usage.completion_tokens;
                span.model = Some(self.model.clone());
                span.provider = Some(self.provider.display_name().to_string());
                if self.collector.verbose() {
                    let finish = response.finish_reason.clone().unwrap_or_default();
                    let preview = response
                        .content
                        .as_deref()
                        .map(preview_text)
                        .unwrap_or_default();
                    span.output_preview = Some(format!("finish={finish}; {preview}"));
                }
                self.collector.emit_span(span.finish(SpanStatus::Ok)).await;
                Ok(response)
            }
            Err(e) => {
                self.collector
                    .emit_span(span.finish_error(e.to_string()))
                    .await;
                if matches!(e, ProviderError::Cancelled) {
                    return Err(anyhow::Error::new(RunCancelled));
                }
                Err(anyhow::Error::new(e)
                    .context(format!("provider call failed at iteration {iteration}")))
            }
        }
    }

    /// Execute the iteration's tool calls: a single call runs inline,
    /// multiple calls run in parallel tasks. Results are reordered back to
    /// the original call index so the conversation stays deterministic.
    async fn execute_tool_calls(
        &self,
        cancel: &CancellationToken,
        req: &RunRequest,
        calls: &[ToolCall],
        trace_id: &str,
        agent_span_id: &str,
    ) -> Result<Vec<(ToolCall, ToolResult)>> {
        let ctx = ToolInvocation {
            channel: req.channel.clone(),
            chat_id: req.chat_id.clone(),
            peer_kind: req.peer_kind,
            session_key: req.session_key.clone(),
            user_id: req.user_id.clone(),
            sender_id: req.sender_id.clone(),
            metadata: req.trace_tags.clone(),
        };

        for call in calls {
            self.events.publish(AgentEvent::ToolCall {
                run_id: req.run_id.clone(),
                session_key: req.session_key.clone(),
                tool: call.function.name.clone(),
                args_preview: truncate_string(&call.function.arguments, 200),
            });
        }

        if calls.len() == 1 {
            let call = calls[0].clone();
            let (result, span) = self
                .run_single_tool(&call, &ctx, trace_id, agent_span_id)
                .await;
            self.collector.emit_span(span).await;
            return Ok(vec![(call, result)]);
        }

        let mut handles = Vec::with_capacity(calls.len());
        for (index, call) in calls.iter().cloned().enumerate() {
            let tools = self.tools.clone();
            let ctx = ctx.clone();
            let trace_id = trace_id.to_string();
            let parent = agent_span_id.to_string();
            let verbose = self.collector.verbose();
            handles.push(tokio::spawn(async move {
                let args = ToolArgs::from_json(&call.function.arguments);
                let mut span = Span::start(
                    &trace_id,
                    SpanType::ToolCall,
                    &call.function.name,
                    Some(parent),
                );
                if verbose {
                    span.input_preview = Some(preview_text(&call.function.arguments));
                }
                let result = tools
                    .execute_with_context(&call.function.name, args, &ctx)
                    .await;
                let span = if result.is_error {
                    span.finish_error(truncate_string(&result.for_llm, PREVIEW_CHARS))
                } else {
                    if verbose {
                        span.output_preview = Some(preview_text(&result.for_llm));
                    }
                    span.finish(SpanStatus::Ok)
                };
                (index, call, result, span)
            }));
        }

        let joined = tokio::select! {
            _ = cancel.cancelled() => return Err(anyhow::Error::new(RunCancelled)),
            joined = futures::future::join_all(handles) => joined,
        };

        let mut outcomes: Vec<(usize, ToolCall, ToolResult, Span)> = Vec::new();
        for join in joined {
            match join {
                Ok(entry) => outcomes.push(entry),
                Err(e) => {
                    // A panicking tool task becomes an error result for a
                    // placeholder call; it cannot be matched back to an ID.
                    warn!(error = %e, "tool task failed to join");
                }
            }
        }
        outcomes.sort_by_key(|(index, _, _, _)| *index);

        let mut results = Vec::with_capacity(outcomes.len());
        for (_, call, result, span) in outcomes {
            self.collector.emit_span(span).await;
            results.push((call, result));
        }
        Ok(results)
    }

    async fn run_single_tool(
        &self,
        call: &ToolCall,
        ctx: &ToolInvocation,
        trace_id: &str,
        agent_span_id: &str,
    ) -> (ToolResult, Span) {
        let args = ToolArgs::from_json(&call.function.arguments);
        let mut span = Span::start(
            trace_id,
            SpanType::ToolCall,
            &call.function.name,
            Some(agent_span_id.to_string()),
        );
        if self.collector.verbose() {
            span.input_preview = Some(preview_text(&call.function.arguments));
        }
        let result = self
            .tools
            .execute_with_context(&call.function.name, args, ctx)
            .await;
        let span = if result.is_error {
            span.finish_error(truncate_string(&result.for_llm, PREVIEW_CHARS))
        } else {
            if self.collector.verbose() {
                span.output_preview = Some(preview_text(&result.for_llm));
            }
            span.finish(SpanStatus::Ok)
        };
        (result, span)
    }

    async fn seed_user_once(&self, user_id: &str) {
        let Some(seed) = self.on_seed_user.clone() else {
            return;
        };
        let latch = {
            let mut latches = self.seed_latches.lock().await;
            latches
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(false)))
                .clone()
        };
        let mut done = latch.lock().await;
        if *done {
            return;
        }
        let workspace = self.context.user_workspace(user_id);
        match seed(user_id.to_string(), workspace).await {
            Ok(()) => {
                debug!(user_id = %user_id, "user seeded");
                *done = true;
            }
            Err(e) => warn!(user_id = %user_id, error = %e, "user seeding failed"),
        }
    }
}

// ─────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────

/// Truncated preview with base64 image payloads elided.
fn preview_text(text: &str) -> String {
    static DATA_URI: OnceLock<Regex> = OnceLock::new();
    let re = DATA_URI.get_or_init(|| {
        Regex::new(r"data:[\w.+/-]+;base64,[A-Za-z0-9+/=]+").expect("data-uri pattern")
    });
    truncate_string(&re.replace_all(text, "[image data]"), PREVIEW_CHARS)
}

fn preview_message(msg: &Message) -> String {
    let text = match msg {
        Message::System { content } => content.clone(),
        Message::User { content } => content.as_text(),
        Message::Assistant { content, .. } => content.clone().unwrap_or_default(),
        Message::Tool { content, .. } => content.clone(),
    };
    preview_text(&text)
}
