//! Typed event fabric — best-effort fan-out of run lifecycle events.
//!
//! Built on `tokio::sync::broadcast`: every subscriber gets its own cursor,
//! and a subscriber that falls behind loses the oldest events for itself
//! (`RecvError::Lagged`) without blocking publishers or other subscribers.
//! Events are never reordered within a subscriber.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default ring-buffer capacity per subscriber.
const DEFAULT_CAPACITY: usize = 256;

/// Events emitted by the agent loop and scheduler during a run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A streaming content fragment from the provider.
    Chunk {
        run_id: String,
        session_key: String,
        content: String,
    },
    /// A streaming thinking/reasoning fragment.
    Thinking {
        run_id: String,
        session_key: String,
        content: String,
    },
    /// The provider layer is retrying a transient failure.
    RunRetrying {
        run_id: String,
        attempt: u32,
        error: String,
    },
    /// A tool call is starting.
    ToolCall {
        run_id: String,
        session_key: String,
        tool: String,
        args_preview: String,
    },
    /// A tool call finished.
    ToolResult {
        run_id: String,
        session_key: String,
        tool: String,
        is_error: bool,
        preview: String,
    },
    /// A run was admitted and started executing.
    RunStarted { run_id: String, session_key: String },
    /// A run reached a terminal state.
    RunFinished {
        run_id: String,
        session_key: String,
        status: RunStatus,
    },
    /// The tool catalogue changed; consumers should drop cached definitions.
    ToolsInvalidated,
}

/// Terminal status carried on [`AgentEvent::RunFinished`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Error,
    Cancelled,
}

/// Fan-out publisher for [`AgentEvent`]s.
///
/// Cheap to clone; all clones publish into the same stream.
#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Best-effort: having no subscribers is not an error.
    pub fn publish(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to the event stream from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(run: &str, text: &str) -> AgentEvent {
        AgentEvent::Chunk {
            run_id: run.into(),
            session_key: "agent:main:cli:direct:1".into(),
            content: text.into(),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let events = EventPublisher::default();
        events.publish(chunk("r1", "hello"));
        assert_eq!(events.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let events = EventPublisher::default();
        let mut rx = events.subscribe();

        events.publish(chunk("r1", "a"));
        events.publish(chunk("r1", "b"));

        match rx.recv().await.unwrap() {
            AgentEvent::Chunk { content, .. } => assert_eq!(content, "a"),
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv().await.unwrap() {
            AgentEvent::Chunk { content, .. } => assert_eq!(content, "b"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest_not_reorders() {
        let events = EventPublisher::new(2);
        let mut rx = events.subscribe();

        for i in 0..5 {
            events.publish(chunk("r1", &format!("c{i}")));
        }

        // The first recv reports the lag, subsequent recvs resume in order.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n >= 1),
            other => panic!("expected lag, got {other:?}"),
        }
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        match (first, second) {
            (
                AgentEvent::Chunk { content: a, .. },
                AgentEvent::Chunk { content: b, .. },
            ) => {
                assert!(a < b, "events must stay ordered: {a} then {b}");
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_independent_subscribers() {
        let events = EventPublisher::default();
        let mut rx1 = events.subscribe();
        let mut rx2 = events.subscribe();

        events.publish(AgentEvent::RunStarted {
            run_id: "r1".into(),
            session_key: "s".into(),
        });

        assert!(matches!(
            rx1.recv().await.unwrap(),
            AgentEvent::RunStarted { .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            AgentEvent::RunStarted { .. }
        ));
    }

    #[test]
    fn test_event_serialization_tagging() {
        let ev = AgentEvent::RunFinished {
            run_id: "r1".into(),
            session_key: "s".into(),
            status: RunStatus::Cancelled,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "run_finished");
        assert_eq!(json["status"], "cancelled");
    }
}
