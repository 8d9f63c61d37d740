mod ack_tracker;
mod auth;
mod clock;
mod connection;
mod dispatcher;
mod dlq;
mod message;
mod metrics;
mod options;
mod queue;
mod queue_manager;
mod rate_limiter;
mod registry;
mod server;

pub use ack_tracker::AckTracker;
pub use auth::Authenticator;
pub use clock::spawn_clock;
pub use dispatcher::BrokerCore;
pub use dlq::{DeadLetterQueue, DeadLetterRecord};
pub use message::{FailureReason, Message};
pub use metrics::{Metrics, MetricsSnapshot};
pub use options::{
    AuthOptions, BrokerOptions, DeliveryMode, ListenerOptions, OverflowStrategy, Priority,
    QueueOptions, RateLimitOptions, TimingOptions,
};
pub use queue::{Delivery, Queue, QueueInfo, PublishOutcome};
pub use queue_manager::QueueManager;
pub use rate_limiter::{ConnectionRateLimiter, MessageRateLimiter};
pub use registry::ConnectionRegistry;
pub use server::run_tcp_server;
