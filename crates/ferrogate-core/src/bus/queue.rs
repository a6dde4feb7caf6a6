//! Async message bus — the spine between channel adapters and the gateway.
//!
//! Channel adapters publish user messages to the inbound side; the inbound
//! router consumes them. Replies and announce deliveries go out on the
//! outbound side, consumed by the channel manager. Both directions are
//! bounded, so a stalled consumer back-pressures publishers instead of
//! growing a queue without limit.

use tokio::sync::mpsc;

use super::types::{InboundMessage, OutboundMessage};

/// One direction of the bus: a bounded queue with a single logical consumer.
///
/// The receiver sits behind a mutex so the consuming side (router, channel
/// manager) can be driven from any task without threading the receiver
/// through constructors.
struct Direction<T> {
    tx: mpsc::Sender<T>,
    rx: tokio::sync::Mutex<mpsc::Receiver<T>>,
}

impl<T> Direction<T> {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    async fn publish(&self, item: T) -> Result<(), mpsc::error::SendError<T>> {
        self.tx.send(item).await
    }

    async fn consume(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }
}

/// The message bus connecting channels ↔ the inbound router.
pub struct MessageBus {
    inbound: Direction<InboundMessage>,
    outbound: Direction<OutboundMessage>,
}

impl MessageBus {
    /// Create a new message bus with the given per-direction capacity.
    pub fn new(buffer_size: usize) -> Self {
        MessageBus {
            inbound: Direction::new(buffer_size),
            outbound: Direction::new(buffer_size),
        }
    }

    /// Publish a message from a channel adapter to the router (inbound).
    pub async fn publish_inbound(
        &self,
        msg: InboundMessage,
    ) -> Result<(), mpsc::error::SendError<InboundMessage>> {
        self.inbound.publish(msg).await
    }

    /// Consume the next inbound message (blocks until available).
    /// Returns None once every adapter handle has been dropped.
    pub async fn consume_inbound(&self) -> Option<InboundMessage> {
        self.inbound.consume().await
    }

    /// Publish a reply from the router to a channel (outbound).
    pub async fn publish_outbound(
        &self,
        msg: OutboundMessage,
    ) -> Result<(), mpsc::error::SendError<OutboundMessage>> {
        self.outbound.publish(msg).await
    }

    /// Consume the next outbound message (blocks until available).
    /// Returns None once every publishing handle has been dropped.
    pub async fn consume_outbound(&self) -> Option<OutboundMessage> {
        self.outbound.consume().await
    }

    /// Get a publishing handle for channel adapters.
    pub fn inbound_sender(&self) -> mpsc::Sender<InboundMessage> {
        self.inbound.tx.clone()
    }

    /// Get a publishing handle for the router's fan-out tasks and announce
    /// paths.
    pub fn outbound_sender(&self) -> mpsc::Sender<OutboundMessage> {
        self.outbound.tx.clone()
    }
}
