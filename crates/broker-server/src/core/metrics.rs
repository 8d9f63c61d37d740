use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// Point-in-time snapshot published on every clock tick (§6 "Health/metrics").
/// The HTTP reader over this snapshot is an external collaborator; the core
/// only needs to publish it and know whether it looks healthy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub active_connections: u64,
    pub queue_count: u64,
    pub in_flight_messages: u64,
    pub memory_usage_bytes: u64,
    pub total_published: u64,
    pub total_delivered: u64,
    pub total_acknowledged: u64,
    pub total_retries: u64,
    pub total_dead_lettered: u64,
    pub total_errors: u64,
    pub total_connections_accepted: u64,
    pub total_connections_rejected: u64,
    pub average_delivery_latency_ms: f64,
}

impl MetricsSnapshot {
    /// "Healthy" per §6: memory headroom under 90%. A zero limit is treated
    /// as "no limit configured" and is always healthy.
    pub fn is_healthy(&self, memory_limit_bytes: u64) -> bool {
        if memory_limit_bytes == 0 {
            return true;
        }
        (self.memory_usage_bytes as f64 / memory_limit_bytes as f64) < 0.9
    }
}

/// Atomic counters mutated from many connection/queue tasks concurrently,
/// plus a `watch` channel so the clock task can publish a coherent snapshot
/// without every mutator needing to know about the channel.
#[derive(Default)]
struct Counters {
    active_connections: AtomicU64,
    queue_count: AtomicU64,
    in_flight_messages: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    acknowledged: AtomicU64,
    retries: AtomicU64,
    dead_lettered: AtomicU64,
    errors: AtomicU64,
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    delivery_latency_sum_ms: AtomicU64,
    delivery_latency_count: AtomicU64,
}

pub struct Metrics {
    counters: Arc<Counters>,
    sender: watch::Sender<MetricsSnapshot>,
}

impl Metrics {
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(MetricsSnapshot::default());
        Self { counters: Arc::new(Counters::default()), sender }
    }

    pub fn subscribe(&self) -> watch::Receiver<MetricsSnapshot> {
        self.sender.subscribe()
    }

    pub fn connection_accepted(&self) {
        self.counters.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.counters.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.counters.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn message_published(&self) {
        self.counters.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_delivered(&self, latency_ms: u64) {
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        self.counters.delivery_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.counters.delivery_latency_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_acknowledged(&self) {
        self.counters.acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_retried(&self) {
        self.counters.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dead_lettered(&self) {
        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_observed(&self) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_queue_count(&self, count: u64) {
        self.counters.queue_count.store(count, Ordering::Relaxed);
    }

    pub fn set_in_flight_messages(&self, count: u64) {
        self.counters.in_flight_messages.store(count, Ordering::Relaxed);
    }

    pub fn set_memory_usage_bytes(&self, bytes: u64) {
        self.counters.memory_usage_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Builds the current snapshot and publishes it to subscribers. Called
    /// once per clock tick.
    pub fn publish_snapshot(&self) -> MetricsSnapshot {
        let latency_count = self.counters.delivery_latency_count.load(Ordering::Relaxed);
        let latency_sum = self.counters.delivery_latency_sum_ms.load(Ordering::Relaxed);
        let average_delivery_latency_ms =
            if latency_count == 0 { 0.0 } else { latency_sum as f64 / latency_count as f64 };

        let snapshot = MetricsSnapshot {
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            queue_count: self.counters.queue_count.load(Ordering::Relaxed),
            in_flight_messages: self.counters.in_flight_messages.load(Ordering::Relaxed),
            memory_usage_bytes: self.counters.memory_usage_bytes.load(Ordering::Relaxed),
            total_published: self.counters.published.load(Ordering::Relaxed),
            total_delivered: self.counters.delivered.load(Ordering::Relaxed),
            total_acknowledged: self.counters.acknowledged.load(Ordering::Relaxed),
            total_retries: self.counters.retries.load(Ordering::Relaxed),
            total_dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            total_errors: self.counters.errors.load(Ordering::Relaxed),
            total_connections_accepted: self.counters.connections_accepted.load(Ordering::Relaxed),
            total_connections_rejected: self.counters.connections_rejected.load(Ordering::Relaxed),
            average_delivery_latency_ms,
        };

        let _ = self.sender.send(snapshot.clone());
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = Metrics::new();
        metrics.connection_accepted();
        metrics.message_published();
        metrics.message_delivered(100);
        metrics.message_delivered(300);

        let snapshot = metrics.publish_snapshot();
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(snapshot.total_published, 1);
        assert_eq!(snapshot.total_delivered, 2);
        assert_eq!(snapshot.average_delivery_latency_ms, 200.0);
    }

    #[test]
    fn health_threshold_is_90_percent() {
        let mut snapshot = MetricsSnapshot::default();
        snapshot.memory_usage_bytes = 899;
        assert!(snapshot.is_healthy(1000));
        snapshot.memory_usage_bytes = 901;
        assert!(!snapshot.is_healthy(1000));
    }

    #[tokio::test]
    async fn subscribers_observe_published_snapshots() {
        let metrics = Metrics::new();
        let mut rx = metrics.subscribe();
        metrics.message_acknowledged();
        metrics.publish_snapshot();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().total_acknowledged, 1);
    }
}
