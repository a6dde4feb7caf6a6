//! Collector contract and the in-process implementations.
//!
//! Collectors may batch asynchronously; losing buffered data on shutdown is
//! acceptable, losing it in steady state is not. The agent loop finishes
//! traces through a detached path on cancellation so terminal writes still
//! land.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::model::{Span, Trace, TraceStatus};

/// Sink for traces and spans.
#[async_trait]
pub trait TraceCollector: Send + Sync {
    /// Record a new trace in `running` state.
    async fn create_trace(&self, trace: Trace);

    /// Mark a trace terminal.
    async fn finish_trace(&self, trace_id: &str, status: TraceStatus);

    /// Stream one completed span.
    async fn emit_span(&self, span: Span);

    /// Whether input/output previews should be captured on spans.
    fn verbose(&self) -> bool {
        false
    }
}

/// Discards everything. The default when tracing is not configured.
pub struct NoopCollector;

#[async_trait]
impl TraceCollector for NoopCollector {
    async fn create_trace(&self, _trace: Trace) {}
    async fn finish_trace(&self, _trace_id: &str, _status: TraceStatus) {}
    async fn emit_span(&self, _span: Span) {}
}

/// Keeps traces and spans in memory. Used by tests and the daemon's
/// diagnostics endpoint.
pub struct MemoryCollector {
    traces: Mutex<Vec<Trace>>,
    spans: Mutex<Vec<Span>>,
    verbose: bool,
}

impl MemoryCollector {
    pub fn new(verbose: bool) -> Self {
        Self {
            traces: Mutex::new(Vec::new()),
            spans: Mutex::new(Vec::new()),
            verbose,
        }
    }

    /// Snapshot of recorded traces.
    pub fn traces(&self) -> Vec<Trace> {
        self.traces.lock().unwrap().clone()
    }

    /// Snapshot of recorded spans.
    pub fn spans(&self) -> Vec<Span> {
        self.spans.lock().unwrap().clone()
    }

    /// Find a trace by run ID.
    pub fn trace_for_run(&self, run_id: &str) -> Option<Trace> {
        self.traces
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.run_id == run_id)
            .cloned()
    }
}

impl Default for MemoryCollector {
    fn default() -> Self {
        Self::new(false)
    }
}

#[async_trait]
impl TraceCollector for MemoryCollector {
    async fn create_trace(&self, trace: Trace) {
        self.traces.lock().unwrap().push(trace);
    }

    async fn finish_trace(&self, trace_id: &str, status: TraceStatus) {
        let mut traces = self.traces.lock().unwrap();
        if let Some(trace) = traces.iter_mut().find(|t| t.id == trace_id) {
            trace.status = status;
            trace.end_time = Some(Utc::now());
        }
    }

    async fn emit_span(&self, span: Span) {
        self.spans.lock().unwrap().push(span);
    }

    fn verbose(&self) -> bool {
        self.verbose
    }
}
