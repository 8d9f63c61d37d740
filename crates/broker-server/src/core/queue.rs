use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use super::dlq::DeadLetterQueue;
use super::error::{BrokerError, BrokerResult};
use super::message::{FailureReason, Message};
use super::options::{DeliveryMode, OverflowStrategy, QueueOptions};

/// One in-flight delivery handed to a subscriber's channel. `delivery_tag` is
/// what `Ack`/`Nack` frames reference; it is distinct from `message.id` so a
/// message redelivered after a nack gets a fresh tag each time.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: String,
    pub message: Message,
}

pub struct Subscriber {
    pub id: String,
    pub sender: mpsc::Sender<Delivery>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed directly to at least one subscriber.
    Delivered,
    /// Sitting in the pending buffer, no subscriber was available.
    Queued,
    /// The incoming message itself was redirected to the DLQ (overflow).
    DeadLettered,
    /// Dropped on the floor per `OverflowStrategy::DropNewest`.
    Dropped,
}

struct QueueInner {
    pending: VecDeque<Message>,
    subscribers: Vec<Subscriber>,
    round_robin_cursor: usize,
}

/// A single named queue: its pending buffer, its subscribers, and the
/// delivery/overflow policy that governs both. Concurrency style follows the
/// teacher's `Arc<Mutex<_>>`-around-shared-state pattern rather than an actor;
/// the `Notify` exists only to wake a blocked publisher when space frees up.
pub struct Queue {
    name: String,
    options: QueueOptions,
    dlq: Arc<DeadLetterQueue>,
    inner: Mutex<QueueInner>,
    capacity_available: Notify,
}

#[derive(Debug, Clone)]
pub struct QueueInfo {
    pub name: String,
    pub depth: usize,
    pub subscriber_count: usize,
    pub delivery_mode: DeliveryMode,
    pub max_size: usize,
}

impl Queue {
    pub fn new(name: String, options: QueueOptions, dlq: Arc<DeadLetterQueue>) -> Self {
        Self {
            name,
            options,
            dlq,
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                subscribers: Vec::new(),
                round_robin_cursor: 0,
            }),
            capacity_available: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn info(&self) -> QueueInfo {
        let inner = self.inner.lock().expect("queue mutex poisoned");
        QueueInfo {
            name: self.name.clone(),
            depth: inner.pending.len(),
            subscriber_count: inner.subscribers.len(),
            delivery_mode: self.options.delivery_mode,
            max_size: self.options.max_size,
        }
    }

    /// Registers a subscriber and immediately tries to drain any pending
    /// backlog to it.
    pub fn add_subscriber(&self, id: String, sender: mpsc::Sender<Delivery>) {
        {
            let mut inner = self.inner.lock().expect("queue mutex poisoned");
            inner.subscribers.push(Subscriber { id, sender });
        }
        self.dispatch_pending();
    }

    pub fn remove_subscriber(&self, id: &str) {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        inner.subscribers.retain(|s| s.id != id);
        if inner.round_robin_cursor >= inner.subscribers.len() {
            inner.round_robin_cursor = 0;
        }
    }

    /// Enqueues `message`, applying the overflow strategy if the queue is at
    /// `max_size`, then attempts immediate delivery (§4.6).
    pub async fn publish(&self, message: Message) -> BrokerResult<PublishOutcome> {
        loop {
            let mut inner = self.inner.lock().expect("queue mutex poisoned");
            if inner.pending.len() < self.options.max_size {
                insert_by_priority(&mut inner.pending, message, self.options.delivery_mode);
                drop(inner);
                return Ok(self.dispatch_pending());
            }

            match self.options.overflow_strategy {
                OverflowStrategy::DropOldest => {
                    inner.pending.pop_front();
                    insert_by_priority(&mut inner.pending, message, self.options.delivery_mode);
                    drop(inner);
                    return Ok(self.dispatch_pending());
                }
                OverflowStrategy::DropNewest => {
                    return Ok(PublishOutcome::Dropped);
                }
                OverflowStrategy::RedirectToDlq => {
                    drop(inner);
                    self.dlq.push(self.name.clone(), message, FailureReason::QueueOverflow);
                    return Ok(PublishOutcome::DeadLettered);
                }
                OverflowStrategy::BlockPublisher => {
                    drop(inner);
                    self.capacity_available.notified().await;
                    continue;
                }
            }
        }
    }

    /// Delivers as much of the pending buffer as current subscribers allow.
    /// Returns whether *this* call handed anything out directly; callers that
    /// don't care (e.g. a retry requeue) can ignore the result.
    pub fn dispatch_pending(&self) -> PublishOutcome {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        if inner.subscribers.is_empty() {
            return PublishOutcome::Queued;
        }

        let mut delivered_any = false;
        match self.options.delivery_mode {
            DeliveryMode::RoundRobin | DeliveryMode::PriorityBased => {
                while let Some(message) = inner.pending.pop_front() {
                    let count = inner.subscribers.len();
                    let idx = inner.round_robin_cursor % count;
                    inner.round_robin_cursor = (inner.round_robin_cursor + 1) % count;
                    let delivery =
                        Delivery { delivery_tag: Uuid::now_v7().to_string(), message: message.clone() };
                    if inner.subscribers[idx].sender.try_send(delivery).is_ok() {
                        delivered_any = true;
                    } else {
                        inner.pending.push_front(message);
                        break;
                    }
                }
            }
            DeliveryMode::FanOutAck | DeliveryMode::FanOutNoAck => {
                while let Some(message) = inner.pending.pop_front() {
                    let mut any_sent = false;
                    for subscriber in inner.subscribers.iter() {
                        let delivery = Delivery {
                            delivery_tag: Uuid::now_v7().to_string(),
                            message: message.clone(),
                        };
                        if subscriber.sender.try_send(delivery).is_ok() {
                            any_sent = true;
                        }
                    }
                    if any_sent {
                        delivered_any = true;
                    } else {
                        inner.pending.push_front(message);
                        break;
                    }
                }
            }
        }

        self.capacity_available.notify_waiters();
        if delivered_any {
            PublishOutcome::Delivered
        } else {
            PublishOutcome::Queued
        }
    }

    /// Puts a message back at the front of the pending buffer after a nack or
    /// ack-timeout, dead-lettering it instead once retries are exhausted
    /// (§4.7/§4.9).
    pub fn requeue_for_retry(&self, mut message: Message) -> BrokerResult<()> {
        message.delivery_attempts += 1;
        if message.delivery_attempts > self.options.max_retry_attempts {
            if self.options.dlq_enabled {
                self.dlq.push(self.name.clone(), message, FailureReason::MaxRetriesExceeded);
            }
            return Ok(());
        }

        {
            let mut inner = self.inner.lock().expect("queue mutex poisoned");
            inner.pending.push_front(message);
        }
        self.dispatch_pending();
        Ok(())
    }

    /// Scans the pending buffer for expired messages, removing and
    /// dead-lettering each one (§4.6 "TTL"). Called from the clock tick.
    pub fn expire_ttl(&self, now: Instant) -> usize {
        let expired: Vec<Message> = {
            let mut inner = self.inner.lock().expect("queue mutex poisoned");
            let mut kept = VecDeque::with_capacity(inner.pending.len());
            let mut expired = Vec::new();
            for message in inner.pending.drain(..) {
                if message.is_expired(now) {
                    expired.push(message);
                } else {
                    kept.push_back(message);
                }
            }
            inner.pending = kept;
            expired
        };

        let count = expired.len();
        for message in expired {
            if self.options.dlq_enabled {
                self.dlq.push(self.name.clone(), message, FailureReason::TtlExpired);
            }
        }
        count
    }

    pub fn ensure_not_full_for_publish(&self) -> BrokerResult<()> {
        let inner = self.inner.lock().expect("queue mutex poisoned");
        if inner.pending.len() >= self.options.max_size
            && self.options.overflow_strategy == OverflowStrategy::BlockPublisher
        {
            return Err(BrokerError::QueueFull(self.name.clone()));
        }
        Ok(())
    }
}

fn insert_by_priority(pending: &mut VecDeque<Message>, message: Message, mode: DeliveryMode) {
    if mode != DeliveryMode::PriorityBased {
        pending.push_back(message);
        return;
    }
    let position = pending.iter().position(|m| m.priority < message.priority);
    match position {
        Some(idx) => pending.insert(idx, message),
        None => pending.push_back(message),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::core::options::Priority;

    fn queue(options: QueueOptions) -> Queue {
        Queue::new("test".to_string(), options, Arc::new(DeadLetterQueue::new(100)))
    }

    fn msg(id: &str, priority: Priority) -> Message {
        Message::ingress(Some(id.to_string()), "test".to_string(), vec![], HashMap::new(), priority, None)
    }

    #[tokio::test]
    async fn publish_without_subscribers_queues() {
        let q = queue(QueueOptions::default());
        let outcome = q.publish(msg("a", Priority::Normal)).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Queued);
        assert_eq!(q.info().depth, 1);
    }

    #[tokio::test]
    async fn round_robin_delivers_to_waiting_subscriber() {
        let q = queue(QueueOptions::default());
        let (tx, mut rx) = mpsc::channel(8);
        q.add_subscriber("sub-1".to_string(), tx);

        let outcome = q.publish(msg("a", Priority::Normal)).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Delivered);
        let delivery = rx.try_recv().expect("delivery sent");
        assert_eq!(delivery.message.id, "a");
    }

    #[tokio::test]
    async fn fan_out_delivers_to_all_subscribers() {
        let mut options = QueueOptions::default();
        options.delivery_mode = DeliveryMode::FanOutNoAck;
        let q = queue(options);
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        q.add_subscriber("a".to_string(), tx1);
        q.add_subscriber("b".to_string(), tx2);

        q.publish(msg("m", Priority::Normal)).await.unwrap();
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn priority_based_orders_pending_by_priority() {
        let mut options = QueueOptions::default();
        options.delivery_mode = DeliveryMode::PriorityBased;
        let q = queue(options);
        q.publish(msg("low", Priority::Low)).await.unwrap();
        q.publish(msg("critical", Priority::Critical)).await.unwrap();
        q.publish(msg("normal", Priority::Normal)).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        q.add_subscriber("sub".to_string(), tx);
        let first = rx.try_recv().unwrap();
        assert_eq!(first.message.id, "critical");
    }

    #[tokio::test]
    async fn drop_newest_rejects_when_full() {
        let mut options = QueueOptions::default();
        options.max_size = 1;
        options.overflow_strategy = OverflowStrategy::DropNewest;
        let q = queue(options);
        q.publish(msg("a", Priority::Normal)).await.unwrap();
        let outcome = q.publish(msg("b", Priority::Normal)).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Dropped);
        assert_eq!(q.info().depth, 1);
    }

    #[tokio::test]
    async fn redirect_to_dlq_sends_overflow_to_dlq() {
        let mut options = QueueOptions::default();
        options.max_size = 1;
        options.overflow_strategy = OverflowStrategy::RedirectToDlq;
        let dlq = Arc::new(DeadLetterQueue::new(100));
        let q = Queue::new("test".to_string(), options, dlq.clone());
        q.publish(msg("a", Priority::Normal)).await.unwrap();
        let outcome = q.publish(msg("b", Priority::Normal)).await.unwrap();
        assert_eq!(outcome, PublishOutcome::DeadLettered);
        assert_eq!(dlq.len(), 1);
    }

    #[test]
    fn requeue_past_max_retries_dead_letters() {
        let q = queue(QueueOptions { max_retry_attempts: 1, ..QueueOptions::default() });
        let mut message = msg("a", Priority::Normal);
        message.delivery_attempts = 1;
        q.requeue_for_retry(message).unwrap();
        assert_eq!(q.info().depth, 0);
    }

    #[test]
    fn expire_ttl_removes_expired_and_dead_letters() {
        let dlq = Arc::new(DeadLetterQueue::new(10));
        let q = Queue::new("test".to_string(), QueueOptions::default(), dlq.clone());
        let mut message = msg("a", Priority::Normal);
        message.ttl = Some(std::time::Duration::from_millis(1));
        // force expiry by treating "now" as well past creation
        let future = message.created_at + std::time::Duration::from_secs(1);
        {
            let mut inner = q.inner.lock().unwrap();
            inner.pending.push_back(message);
        }
        let removed = q.expire_ttl(future);
        assert_eq!(removed, 1);
        assert_eq!(dlq.len(), 1);
    }
}
