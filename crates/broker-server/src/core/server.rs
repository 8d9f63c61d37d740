use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::AppState;

use super::connection::handle_connection;
use super::rate_limiter::MessageRateLimiter;

/// Runs the TCP accept loop and spawns one task per accepted client,
/// following the teacher's `run_tcp_server` shape: `tokio::select!` racing
/// the shutdown token against `listener.accept()`.
pub async fn run_tcp_server(listen: &str, state: AppState) -> Result<()> {
    let listener =
        TcpListener::bind(listen).await.with_context(|| format!("failed to bind tcp listener on {listen}"))?;
    info!("broker listening: addr={listen}");

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                info!("tcp server stopping");
                state.connections.disconnect_all();
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = accepted.context("tcp accept failed")?;

                if state.connections.count() >= state.core.options.listener.max_connections {
                    state.core.metrics.connection_rejected();
                    warn!("connection rejected: reason=max_connections, peer={peer_addr}");
                    continue;
                }

                if !state.connection_rate_limiter.admit(peer_addr.ip()) {
                    state.core.metrics.connection_rejected();
                    warn!("connection rejected: reason=rate_limited, peer={peer_addr}");
                    continue;
                }

                let connection_id = Uuid::now_v7().to_string();
                let cancel = state.connections.register(connection_id.clone(), peer_addr, &state.shutdown);
                state.core.metrics.connection_accepted();

                let core = state.core.clone();
                let registry = state.connections.clone();
                let max_message_size = state.core.options.listener.max_message_size;
                let keep_alive = state.core.options.timing.keep_alive_interval;
                let auth_required = state.core.options.auth.enabled;
                let message_rate_limiter = MessageRateLimiter::new(&state.core.options.rate_limit);
                let task_connection_id = connection_id.clone();

                tokio::spawn(async move {
                    handle_connection(
                        stream,
                        peer_addr,
                        task_connection_id.clone(),
                        core,
                        max_message_size,
                        keep_alive,
                        auth_required,
                        message_rate_limiter,
                        cancel,
                    )
                    .await;
                    registry.deregister(&task_connection_id);
                });
            }
        }
    }

    Ok(())
}
