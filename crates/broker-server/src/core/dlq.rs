use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use uuid::Uuid;

use super::message::{FailureReason, Message};

/// One dead-lettered message plus why it ended up here (§3 "Dead-letter
/// record").
#[derive(Debug, Clone)]
pub struct DeadLetterRecord {
    pub id: String,
    pub original_queue: String,
    pub message: Message,
    pub reason: FailureReason,
    pub dead_lettered_at: SystemTime,
}

/// A bounded ring buffer of dead-lettered messages (§4.9). Overflow drops
/// the oldest entry and bumps a counter rather than growing unbounded.
pub struct DeadLetterQueue {
    capacity: usize,
    records: Mutex<VecDeque<DeadLetterRecord>>,
    overflowed: AtomicU64,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
            overflowed: AtomicU64::new(0),
        }
    }

    /// Dead-letters `message`, returning the freshly assigned record id.
    pub fn push(&self, original_queue: String, message: Message, reason: FailureReason) -> String {
        let record = DeadLetterRecord {
            id: Uuid::now_v7().to_string(),
            original_queue,
            message,
            reason,
            dead_lettered_at: SystemTime::now(),
        };
        let id = record.id.clone();

        let mut records = self.records.lock().expect("dlq mutex poisoned");
        if records.len() >= self.capacity {
            records.pop_front();
            self.overflowed.fetch_add(1, Ordering::Relaxed);
        }
        records.push_back(record);
        id
    }

    /// Lists records, most recent first, optionally filtered by originating
    /// queue and/or reason.
    pub fn list(
        &self,
        queue_filter: Option<&str>,
        reason_filter: Option<FailureReason>,
        limit: usize,
    ) -> Vec<DeadLetterRecord> {
        let records = self.records.lock().expect("dlq mutex poisoned");
        records
            .iter()
            .rev()
            .filter(|r| queue_filter.is_none_or(|q| r.original_queue == q))
            .filter(|r| reason_filter.is_none_or(|reason| r.reason == reason))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Removes and returns a record by id, for `ReplayDlq`.
    pub fn take(&self, id: &str) -> Option<DeadLetterRecord> {
        let mut records = self.records.lock().expect("dlq mutex poisoned");
        let pos = records.iter().position(|r| r.id == id)?;
        records.remove(pos)
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("dlq mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::core::options::Priority;

    fn msg(id: &str, queue: &str) -> Message {
        Message::ingress(
            Some(id.to_string()),
            queue.to_string(),
            vec![],
            HashMap::new(),
            Priority::Normal,
            None,
        )
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let dlq = DeadLetterQueue::new(2);
        dlq.push("q".into(), msg("a", "q"), FailureReason::TtlExpired);
        dlq.push("q".into(), msg("b", "q"), FailureReason::TtlExpired);
        dlq.push("q".into(), msg("c", "q"), FailureReason::TtlExpired);

        assert_eq!(dlq.len(), 2);
        assert_eq!(dlq.overflow_count(), 1);
        let ids: Vec<_> = dlq.list(None, None, 10).into_iter().map(|r| r.message.id).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[test]
    fn take_removes_record() {
        let dlq = DeadLetterQueue::new(10);
        let id = dlq.push("q".into(), msg("a", "q"), FailureReason::MaxRetriesExceeded);
        assert_eq!(dlq.len(), 1);
        let record = dlq.take(&id).expect("record present");
        assert_eq!(record.message.id, "a");
        assert!(dlq.is_empty());
        assert!(dlq.take(&id).is_none());
    }

    #[test]
    fn list_filters_by_queue_and_reason() {
        let dlq = DeadLetterQueue::new(10);
        dlq.push("orders".into(), msg("a", "orders"), FailureReason::TtlExpired);
        dlq.push("orders".into(), msg("b", "orders"), FailureReason::MaxRetriesExceeded);
        dlq.push("events".into(), msg("c", "events"), FailureReason::TtlExpired);

        let orders_only = dlq.list(Some("orders"), None, 10);
        assert_eq!(orders_only.len(), 2);

        let ttl_only = dlq.list(None, Some(FailureReason::TtlExpired), 10);
        assert_eq!(ttl_only.len(), 2);

        let orders_ttl = dlq.list(Some("orders"), Some(FailureReason::TtlExpired), 10);
        assert_eq!(orders_ttl.len(), 1);
        assert_eq!(orders_ttl[0].message.id, "a");
    }
}
