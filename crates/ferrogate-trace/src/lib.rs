//! Run tracing: traces, spans, and the collector contract.
//!
//! A trace is created per root run and finished on its terminal outcome.
//! Spans are ephemeral and streamed to the collector as they complete:
//! one `agent` span per run, one `llm_call` span per provider call, one
//! `tool_call` span per tool execution. Parent/child nesting is carried by
//! [`TraceContext`], a small cloneable handle threaded through the run.

pub mod collector;
pub mod model;

pub use collector::{MemoryCollector, NoopCollector, TraceCollector};
pub use model::{Span, SpanStatus, SpanType, Trace, TraceStatus};

/// Request-scoped trace linkage, cloned into child work.
///
/// `parent_span_id` is the span a new child span should attach to;
/// `root_span_id` is the run's `agent` span, which announce runs reference
/// so their traces nest under the originating user run.
#[derive(Clone, Debug, Default)]
pub struct TraceContext {
    pub trace_id: Option<String>,
    pub root_span_id: Option<String>,
    pub parent_span_id: Option<String>,
}

impl TraceContext {
    /// Context for a fresh root trace.
    pub fn root(trace_id: impl Into<String>, root_span_id: impl Into<String>) -> Self {
        let root = root_span_id.into();
        TraceContext {
            trace_id: Some(trace_id.into()),
            root_span_id: Some(root.clone()),
            parent_span_id: Some(root),
        }
    }

    /// Derive a context whose children attach under `span_id`.
    pub fn child_of(&self, span_id: impl Into<String>) -> Self {
        TraceContext {
            trace_id: self.trace_id.clone(),
            root_span_id: self.root_span_id.clone(),
            parent_span_id: Some(span_id.into()),
        }
    }

    /// Whether any trace is active.
    pub fn is_active(&self) -> bool {
        self.trace_id.is_some()
    }
}
