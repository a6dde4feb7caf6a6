//! Per-sender debounce: merge message bursts into one combined message.
//!
//! People send thoughts in fragments. Each `(channel, sender, chat)` gets a
//! bucket; messages arriving within the window join the bucket and push the
//! deadline out. When the window closes the bucket flushes as a single
//! message whose content is the fragments joined in arrival order and whose
//! metadata carries the latest values. Nothing is ever dropped: shutdown
//! flushes every bucket immediately.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::debug;

use ferrogate_core::bus::types::InboundMessage;

struct Bucket {
    messages: Vec<InboundMessage>,
    deadline: Instant,
}

struct Inner {
    window: Duration,
    buckets: Mutex<HashMap<String, Bucket>>,
    flush_tx: mpsc::Sender<InboundMessage>,
}

/// Debouncer over the inbound stream. Flushed (merged) messages arrive on
/// the receiver returned by [`Debouncer::new`].
pub struct Debouncer {
    inner: Arc<Inner>,
}

impl Debouncer {
    /// Create a debouncer. Merged messages are delivered on the returned
    /// receiver in flush order.
    pub fn new(window: Duration) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (flush_tx, flush_rx) = mpsc::channel(64);
        let inner = Arc::new(Inner {
            window,
            buckets: Mutex::new(HashMap::new()),
            flush_tx,
        });
        (Self { inner }, flush_rx)
    }

    fn bucket_key(msg: &InboundMessage) -> String {
        format!("{}|{}|{}", msg.channel, msg.sender_id, msg.chat_id)
    }

    /// Add a message to its sender's bucket. The first message of a bucket
    /// spawns the flusher task; later arrivals extend the deadline.
    pub async fn push(&self, msg: InboundMessage) {
        let key = Self::bucket_key(&msg);
        let deadline = Instant::now() + self.inner.window;

        let mut buckets = self.inner.buckets.lock().await;
        match buckets.get_mut(&key) {
            Some(bucket) => {
                bucket.messages.push(msg);
                bucket.deadline = deadline;
            }
            None => {
                buckets.insert(
                    key.clone(),
                    Bucket {
                        messages: vec![msg],
                        deadline,
                    },
                );
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    flusher(inner, key).await;
                });
            }
        }
    }

    /// Flush every bucket immediately (shutdown path — work is preserved,
    /// not dropped).
    pub async fn flush_all(&self) {
        let drained: Vec<Bucket> = {
            let mut buckets = self.inner.buckets.lock().await;
            buckets.drain().map(|(_, bucket)| bucket).collect()
        };
        for bucket in drained {
            let merged = merge_messages(bucket.messages);
            let _ = self.inner.flush_tx.send(merged).await;
        }
    }
}

/// Waits out the (sliding) deadline, then flushes the bucket.
async fn flusher(inner: Arc<Inner>, key: String) {
    loop {
        let deadline = {
            let buckets = inner.buckets.lock().await;
            match buckets.get(&key) {
                Some(bucket) => bucket.deadline,
                // flush_all got here first.
                None => return,
            }
        };
        tokio::time::sleep_until(deadline).await;

        let bucket = {
            let mut buckets = inner.buckets.lock().await;
            let expired = match buckets.get(&key) {
                Some(b) => b.deadline <= Instant::now(),
                // flush_all got here first.
                None => return,
            };
            if expired {
                buckets.remove(&key)
            } else {
                // A late arrival moved the deadline; keep waiting.
                None
            }
        };
        match bucket {
            Some(bucket) => {
                debug!(key = %key, merged = bucket.messages.len(), "debounce window closed");
                let merged = merge_messages(bucket.messages);
                let _ = inner.flush_tx.send(merged).await;
                return;
            }
            None => continue,
        }
    }
}

/// Merge burst fragments into one message: contents joined in arrival order,
/// media concatenated, metadata and optional fields take the latest value.
fn merge_messages(mut messages: Vec<InboundMessage>) -> InboundMessage {
    debug_assert!(!messages.is_empty());
    if messages.len() == 1 {
        return messages.pop().unwrap();
    }

    let mut base = messages.remove(0);
    for msg in messages {
        if !msg.content.is_empty() {
            if !base.content.is_empty() {
                base.content.push('\n');
            }
            base.content.push_str(&msg.content);
        }
        base.media.extend(msg.media);
        base.metadata.extend(msg.metadata);
        if msg.agent_id.is_some() {
            base.agent_id = msg.agent_id;
        }
        if msg.user_id.is_some() {
            base.user_id = msg.user_id;
        }
        if msg.history_limit.is_some() {
            base.history_limit = msg.history_limit;
        }
        base.peer_kind = msg.peer_kind;
        base.timestamp = msg.timestamp;
    }
    base
}
