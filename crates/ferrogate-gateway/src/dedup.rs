//! Inbound message deduplication.
//!
//! Channels redeliver: webhook retries, reconnect replays, at-least-once
//! queues. Any message carrying a `message_id` is checked against a
//! time-and-size bounded set; a key seen within the TTL is dropped silently.
//! The window is anchored at first sight (re-deliveries do not extend it),
//! and the LRU cap bounds memory on busy gateways.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::debug;

/// TTL + LRU bounded set of seen message keys.
pub struct DedupSet {
    ttl: Duration,
    seen: Mutex<LruCache<String, Instant>>,
}

impl DedupSet {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            ttl,
            seen: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Canonical dedup key for an inbound message.
    pub fn key_for(channel: &str, sender_id: &str, chat_id: &str, message_id: &str) -> String {
        format!("{channel}|{sender_id}|{chat_id}|{message_id}")
    }

    /// Record a key. Returns `true` if the key is fresh (processing should
    /// continue), `false` if it is a duplicate within the TTL.
    pub fn check_and_insert(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap();

        if let Some(first_seen) = seen.get(key) {
            if now.duration_since(*first_seen) < self.ttl {
                debug!(key = %key, "duplicate message dropped");
                return false;
            }
        }
        seen.put(key.to_string(), now);
        true
    }

    /// Number of tracked keys (diagnostics).
    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sight_is_fresh() {
        let set = DedupSet::new(Duration::from_secs(60), 100);
        assert!(set.check_and_insert("telegram|u1|c1|m1"));
    }

    #[test]
    fn test_second_sight_is_duplicate() {
        let set = DedupSet::new(Duration::from_secs(60), 100);
        let key = DedupSet::key_for("telegram", "u1", "c1", "m1");
        assert!(set.check_and_insert(&key));
        assert!(!set.check_and_insert(&key));
        assert!(!set.check_and_insert(&key));
    }

    #[test]
    fn test_distinct_senders_are_distinct_keys() {
        let set = DedupSet::new(Duration::from_secs(60), 100);
        assert!(set.check_and_insert(&DedupSet::key_for("telegram", "u1", "c1", "m1")));
        assert!(set.check_and_insert(&DedupSet::key_for("telegram", "u2", "c1", "m1")));
        assert!(set.check_and_insert(&DedupSet::key_for("discord", "u1", "c1", "m1")));
    }

    #[test]
    fn test_expired_entry_is_fresh_again() {
        let set = DedupSet::new(Duration::from_millis(0), 100);
        let key = "k";
        assert!(set.check_and_insert(key));
        // TTL of zero: the entry is immediately stale.
        assert!(set.check_and_insert(key));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let set = DedupSet::new(Duration::from_secs(60), 2);
        assert!(set.check_and_insert("a"));
        assert!(set.check_and_insert("b"));
        assert!(set.check_and_insert("c"));
        // "a" was evicted by the LRU cap, so it reads as fresh.
        assert!(set.check_and_insert("a"));
        assert_eq!(set.len(), 2);
    }
}
