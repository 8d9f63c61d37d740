use std::time::Duration;

/// Delivery policy for a queue's pending messages. See §4.6/§GLOSSARY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    RoundRobin,
    FanOutAck,
    FanOutNoAck,
    PriorityBased,
}

/// Policy applied when a queue is at `max_size` on publish. See §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowStrategy {
    DropOldest,
    DropNewest,
    BlockPublisher,
    RedirectToDlq,
}

/// Message priority, ordered `Low < Normal < High < Critical` so
/// `PriorityBased` queues can sort pending messages by `Reverse(priority)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Per-queue defaults, also used as the template for auto-created queues.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub delivery_mode: DeliveryMode,
    pub max_size: usize,
    pub auto_create: bool,
    pub message_ttl: Option<Duration>,
    pub dlq_enabled: bool,
    pub max_retry_attempts: u32,
    pub overflow_strategy: OverflowStrategy,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            delivery_mode: DeliveryMode::RoundRobin,
            max_size: 10_000,
            auto_create: true,
            message_ttl: None,
            dlq_enabled: true,
            max_retry_attempts: 3,
            overflow_strategy: OverflowStrategy::DropOldest,
        }
    }
}

/// Listener-facing options. TLS is carried as configuration but the core
/// does not terminate TLS itself — see `DESIGN.md`.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub port: u16,
    pub max_connections: usize,
    pub max_message_size: u32,
    pub tls_enabled: bool,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            port: 8080,
            max_connections: 10_000,
            max_message_size: broker_proto::DEFAULT_MAX_FRAME_LEN,
            tls_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuthOptions {
    pub enabled: bool,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitOptions {
    pub enabled: bool,
    pub max_connections_per_ip_per_window: u32,
    pub connection_window_secs: u64,
    pub max_messages_per_client_per_second: u32,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_connections_per_ip_per_window: 20,
            connection_window_secs: 10,
            max_messages_per_client_per_second: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TimingOptions {
    pub keep_alive_interval: Duration,
    pub handshake_timeout: Duration,
    pub ack_timeout: Duration,
    pub shutdown_grace: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for TimingOptions {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5 * 60),
        }
    }
}

/// The typed, construction-time options record the broker core accepts.
/// Nothing under this type ever touches the filesystem or environment —
/// that is `crate::config`'s job.
#[derive(Debug, Clone, Default)]
pub struct BrokerOptions {
    pub listener: ListenerOptions,
    pub auth: AuthOptions,
    pub queue_defaults: QueueOptions,
    pub rate_limit: RateLimitOptions,
    pub timing: TimingOptions,
    pub dlq_capacity: usize,
}

impl BrokerOptions {
    pub fn dlq_capacity_or_default(&self) -> usize {
        if self.dlq_capacity == 0 { 10_000 } else { self.dlq_capacity }
    }
}
