use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};

use uuid::Uuid;

use super::options::Priority;

/// The broker's internal message envelope (§3 "Message"). Distinct from
/// `broker_proto::ProtocolMessage`, which is only the wire representation of
/// a single frame — a `Message` lives in queues, the ack tracker and the DLQ
/// across many frames (original delivery + retries).
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub queue: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub priority: Priority,
    /// Monotonic ingress timestamp, the TTL clock source.
    pub created_at: Instant,
    /// Wall-clock ingress timestamp, surfaced to subscribers/headers only.
    pub created_at_wall: SystemTime,
    pub delivery_attempts: u32,
    pub ttl: Option<Duration>,
}

impl Message {
    /// Stamps a freshly published message: assigns an id if the publisher
    /// omitted one, and records both ingress clocks.
    pub fn ingress(
        id: Option<String>,
        queue: String,
        payload: Vec<u8>,
        headers: HashMap<String, String>,
        priority: Priority,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            id: id.unwrap_or_else(|| Uuid::now_v7().to_string()),
            queue,
            payload,
            headers,
            priority,
            created_at: Instant::now(),
            created_at_wall: SystemTime::now(),
            delivery_attempts: 0,
            ttl,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => self.created_at + ttl <= now,
            None => false,
        }
    }

    /// Resets delivery bookkeeping and ingress clocks; used by DLQ replay
    /// (§4.9) so a replayed message gets a full retry budget.
    pub fn reingest(&mut self) {
        self.created_at = Instant::now();
        self.created_at_wall = SystemTime::now();
        self.delivery_attempts = 0;
    }
}

/// Reason a message landed in the dead-letter queue (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    MaxRetriesExceeded,
    TtlExpired,
    DeserializationError,
    HandlerRejected,
    QueueOverflow,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::MaxRetriesExceeded => "MaxRetriesExceeded",
            FailureReason::TtlExpired => "TtlExpired",
            FailureReason::DeserializationError => "DeserializationError",
            FailureReason::HandlerRejected => "HandlerRejected",
            FailureReason::QueueOverflow => "QueueOverflow",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_checks_ttl_from_monotonic_clock() {
        let msg = Message::ingress(
            None,
            "q".to_string(),
            vec![],
            HashMap::new(),
            Priority::Normal,
            Some(Duration::from_millis(10)),
        );
        assert!(!msg.is_expired(Instant::now()));
        assert!(msg.is_expired(Instant::now() + Duration::from_millis(20)));
    }

    #[test]
    fn reingest_resets_attempts_and_clock() {
        let mut msg = Message::ingress(
            Some("fixed-id".to_string()),
            "q".to_string(),
            vec![],
            HashMap::new(),
            Priority::Normal,
            None,
        );
        msg.delivery_attempts = 3;
        let before = msg.created_at;
        std::thread::sleep(Duration::from_millis(5));
        msg.reingest();
        assert_eq!(msg.delivery_attempts, 0);
        assert!(msg.created_at > before);
        assert_eq!(msg.id, "fixed-id");
    }
}
