//! Trace and span data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal (or live) state of a trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Running,
    Completed,
    Error,
    Cancelled,
}

/// What a span measured.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanType {
    Agent,
    LlmCall,
    ToolCall,
}

/// Outcome of a span.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Ok,
    Error,
}

/// One trace per root run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub id: String,
    pub run_id: String,
    pub session_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub name: String,
    pub status: TraceStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Trace of the originating user run, for announce runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_trace_id: Option<String>,
}

impl Trace {
    /// Start a new running trace with a fresh ID.
    pub fn start(
        run_id: impl Into<String>,
        session_key: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Trace {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            session_key: session_key.into(),
            user_id: None,
            channel: None,
            name: name.into(),
            status: TraceStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            parent_trace_id: None,
        }
    }
}

/// A timed unit of work within a trace.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    pub id: String,
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub span_type: SpanType,
    pub name: String,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: SpanStatus,
    /// Truncated input (verbose collectors only; image payloads elided).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_preview: Option<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Span {
    /// Start a span now; call [`finish`](Self::finish) to stamp the end.
    pub fn start(
        trace_id: impl Into<String>,
        span_type: SpanType,
        name: impl Into<String>,
        parent_span_id: Option<String>,
    ) -> Self {
        Span {
            id: uuid::Uuid::new_v4().to_string(),
            trace_id: trace_id.into(),
            parent_span_id,
            span_type,
            name: name.into(),
            start_time: Utc::now(),
            end_time: None,
            status: SpanStatus::Ok,
            input_preview: None,
            output_preview: None,
            input_tokens: 0,
            output_tokens: 0,
            model: None,
            provider: None,
            error: None,
        }
    }

    /// Stamp the end time with the given status.
    pub fn finish(mut self, status: SpanStatus) -> Self {
        self.end_time = Some(Utc::now());
        self.status = status;
        self
    }

    /// Stamp the end time with an error.
    pub fn finish_error(mut self, error: impl Into<String>) -> Self {
        self.end_time = Some(Utc::now());
        self.status = SpanStatus::Error;
        self.error = Some(error.into());
        self
    }
}
