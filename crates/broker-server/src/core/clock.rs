use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dispatcher::BrokerCore;
use super::rate_limiter::ConnectionRateLimiter;

/// The broker's single background tick: sweeps ack timeouts back onto their
/// queues, expires TTLs, prunes idle rate-limit entries and republishes a
/// metrics snapshot. Shaped like the teacher's `spawn_periodic_scan` — an
/// `interval` racing the shutdown token inside `tokio::select!` — just
/// scanning in-memory state instead of a spool directory.
pub async fn spawn_clock(
    core: Arc<BrokerCore>,
    connection_rate_limiter: Arc<ConnectionRateLimiter>,
    tick: Duration,
    shutdown: CancellationToken,
) {
    let ack_timeout = core.options.timing.ack_timeout;
    let mut ticker = interval(tick.max(Duration::from_millis(50)));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("clock loop stopping");
                break;
            }
            _ = ticker.tick() => {
                let now = Instant::now();

                let expired_ttl = core.queues.expire_all_ttl(now).await;
                if expired_ttl > 0 {
                    debug!("ttl sweep: expired={expired_ttl}");
                }

                let expired_acks = core.ack_tracker.sweep_expired(ack_timeout, now);
                for pending in expired_acks {
                    if let Some(queue) = core.queues.get(&pending.queue).await {
                        if let Err(err) = queue.requeue_for_retry(pending.message) {
                            warn!("ack-timeout requeue failed: queue={}, error={err}", pending.queue);
                        }
                        core.metrics.message_retried();
                    }
                }

                connection_rate_limiter.prune_idle(Duration::from_secs(300));

                core.metrics.set_queue_count(core.queues.count().await as u64);
                core.metrics.set_in_flight_messages(core.queues.total_depth().await as u64);
                core.metrics.publish_snapshot();
            }
        }
    }
}
