use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::{BrokerCore, BrokerOptions, ConnectionRateLimiter, ConnectionRegistry};

/// Everything a connection task or the clock loop needs, bundled once at
/// startup. Mirrors the teacher's `AppState` pattern: a handful of `Arc`
/// fields plus one shared shutdown token, cloned cheaply per task.
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<BrokerCore>,
    pub connections: Arc<ConnectionRegistry>,
    pub connection_rate_limiter: Arc<ConnectionRateLimiter>,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(options: BrokerOptions) -> Self {
        let connection_rate_limiter = Arc::new(ConnectionRateLimiter::new(options.rate_limit));
        Self {
            core: Arc::new(BrokerCore::new(options)),
            connections: Arc::new(ConnectionRegistry::new()),
            connection_rate_limiter,
            shutdown: CancellationToken::new(),
        }
    }
}
