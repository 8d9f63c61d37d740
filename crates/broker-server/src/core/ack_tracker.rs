use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::message::Message;

/// A delivery waiting on `Ack`/`Nack` from a subscriber.
#[derive(Debug, Clone)]
pub struct PendingAck {
    pub queue: String,
    pub message: Message,
    pub sent_at: Instant,
}

/// In-flight deliveries awaiting acknowledgement, keyed by delivery tag
/// (§4.7). A background tick (see `core::clock`) calls `sweep_expired` to
/// find acks that timed out and hand them back to the queue for retry —
/// mirroring the teacher's `spawn_periodic_scan` tick-and-act shape, just
/// scanning an in-memory map instead of a spool directory.
pub struct AckTracker {
    pending: Mutex<HashMap<String, PendingAck>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self { pending: Mutex::new(HashMap::new()) }
    }

    pub fn register(&self, delivery_tag: String, queue: String, message: Message) {
        let mut pending = self.pending.lock().expect("ack tracker mutex poisoned");
        pending.insert(delivery_tag, PendingAck { queue, message, sent_at: Instant::now() });
    }

    /// Confirms successful processing, removing the entry. Returns `None` if
    /// the tag is unknown (already acked, nacked, or expired).
    pub fn ack(&self, delivery_tag: &str) -> Option<PendingAck> {
        self.pending.lock().expect("ack tracker mutex poisoned").remove(delivery_tag)
    }

    /// Explicit negative ack; the caller is expected to requeue the returned
    /// message on the owning queue.
    pub fn nack(&self, delivery_tag: &str) -> Option<PendingAck> {
        self.pending.lock().expect("ack tracker mutex poisoned").remove(delivery_tag)
    }

    /// Removes and returns every pending ack older than `ack_timeout`, for
    /// the clock tick to requeue as retries (§4.7 "Ack timeout").
    pub fn sweep_expired(&self, ack_timeout: Duration, now: Instant) -> Vec<PendingAck> {
        let mut pending = self.pending.lock().expect("ack tracker mutex poisoned");
        let expired_tags: Vec<String> = pending
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.sent_at) >= ack_timeout)
            .map(|(tag, _)| tag.clone())
            .collect();

        expired_tags.into_iter().filter_map(|tag| pending.remove(&tag)).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().expect("ack tracker mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;

    use super::*;
    use crate::core::options::Priority;

    fn msg(id: &str) -> Message {
        Message::ingress(Some(id.to_string()), "q".to_string(), vec![], StdHashMap::new(), Priority::Normal, None)
    }

    #[test]
    fn ack_removes_entry() {
        let tracker = AckTracker::new();
        tracker.register("tag-1".to_string(), "q".to_string(), msg("a"));
        assert_eq!(tracker.len(), 1);
        let acked = tracker.ack("tag-1").unwrap();
        assert_eq!(acked.message.id, "a");
        assert!(tracker.is_empty());
    }

    #[test]
    fn nack_returns_message_for_requeue() {
        let tracker = AckTracker::new();
        tracker.register("tag-1".to_string(), "q".to_string(), msg("a"));
        let nacked = tracker.nack("tag-1").unwrap();
        assert_eq!(nacked.queue, "q");
        assert!(tracker.nack("tag-1").is_none());
    }

    #[test]
    fn sweep_expired_only_removes_stale_entries() {
        let tracker = AckTracker::new();
        tracker.register("stale".to_string(), "q".to_string(), msg("a"));
        std::thread::sleep(Duration::from_millis(20));
        tracker.register("fresh".to_string(), "q".to_string(), msg("b"));

        let expired = tracker.sweep_expired(Duration::from_millis(10), Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].message.id, "a");
        assert_eq!(tracker.len(), 1);
    }
}
