use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::options::RateLimitOptions;

/// A single fixed, coarse-granularity window counter: `max` permits per
/// `window`, reset wholesale once the window elapses (§4.3 "Windows are
/// coarse... and reset by the background clock"). Self-resetting on
/// `try_consume` rather than requiring an external tick keeps this correct
/// even if a connection is quiet for multiple windows in a row.
struct FixedWindowCounter {
    max: u32,
    window: Duration,
    window_start: Instant,
    count: u32,
}

impl FixedWindowCounter {
    fn new(max: u32, window: Duration) -> Self {
        Self { max, window, window_start: Instant::now(), count: 0 }
    }

    fn try_consume(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.count = 0;
        }
        if self.count < self.max {
            self.count += 1;
            true
        } else {
            false
        }
    }
}

/// Per-source-address connection limiter: at most K1 new connections per W1
/// seconds per IP (§4.3). Advisory (always allows) when disabled.
pub struct ConnectionRateLimiter {
    options: RateLimitOptions,
    counters: Mutex<HashMap<IpAddr, FixedWindowCounter>>,
}

impl ConnectionRateLimiter {
    pub fn new(options: RateLimitOptions) -> Self {
        Self { options, counters: Mutex::new(HashMap::new()) }
    }

    /// Returns `true` if a new connection from `addr` should be admitted.
    pub fn admit(&self, addr: IpAddr) -> bool {
        if !self.options.enabled {
            return true;
        }
        let window = Duration::from_secs(self.options.connection_window_secs.max(1));
        let max = self.options.max_connections_per_ip_per_window;
        let now = Instant::now();

        let mut counters = self.counters.lock().expect("rate limiter mutex poisoned");
        counters.entry(addr).or_insert_with(|| FixedWindowCounter::new(max, window)).try_consume(now)
    }

    /// Drops entries whose window has been idle for a while, bounding
    /// directory growth under many distinct source IPs.
    pub fn prune_idle(&self, idle_for: Duration) {
        let now = Instant::now();
        let mut counters = self.counters.lock().expect("rate limiter mutex poisoned");
        counters.retain(|_, counter| now.duration_since(counter.window_start) < idle_for);
    }

    pub fn tracked_addresses(&self) -> usize {
        self.counters.lock().expect("rate limiter mutex poisoned").len()
    }
}

/// Per-connection inbound-Publish limiter: at most K2 frames per second
/// (§4.3). Owned by a single `Connection`, so no locking is needed beyond
/// what the connection's own task boundary already provides.
pub struct MessageRateLimiter {
    enabled: bool,
    counter: Mutex<FixedWindowCounter>,
}

impl MessageRateLimiter {
    pub fn new(options: &RateLimitOptions) -> Self {
        Self {
            enabled: options.enabled,
            counter: Mutex::new(FixedWindowCounter::new(
                options.max_messages_per_client_per_second,
                Duration::from_secs(1),
            )),
        }
    }

    pub fn try_consume(&self) -> bool {
        if !self.enabled {
            return true;
        }
        self.counter.lock().expect("rate limiter mutex poisoned").try_consume(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(max: u32, window_secs: u64) -> RateLimitOptions {
        RateLimitOptions {
            enabled: true,
            max_connections_per_ip_per_window: max,
            connection_window_secs: window_secs,
            max_messages_per_client_per_second: max,
        }
    }

    #[test]
    fn connection_limiter_admits_up_to_k1_then_rejects() {
        let limiter = ConnectionRateLimiter::new(opts(2, 60));
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(limiter.admit(ip));
        assert!(limiter.admit(ip));
        assert!(!limiter.admit(ip));
    }

    #[test]
    fn connection_limiter_is_per_address() {
        let limiter = ConnectionRateLimiter::new(opts(1, 60));
        let a: IpAddr = "127.0.0.1".parse().unwrap();
        let b: IpAddr = "127.0.0.2".parse().unwrap();
        assert!(limiter.admit(a));
        assert!(!limiter.admit(a));
        assert!(limiter.admit(b));
    }

    #[test]
    fn disabled_connection_limiter_always_admits() {
        let mut options = opts(1, 60);
        options.enabled = false;
        let limiter = ConnectionRateLimiter::new(options);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        for _ in 0..5 {
            assert!(limiter.admit(ip));
        }
    }

    #[test]
    fn message_limiter_resets_after_window_elapses() {
        let mut counter = FixedWindowCounter::new(1, Duration::from_millis(10));
        let t0 = Instant::now();
        assert!(counter.try_consume(t0));
        assert!(!counter.try_consume(t0));
        assert!(counter.try_consume(t0 + Duration::from_millis(20)));
    }
}
