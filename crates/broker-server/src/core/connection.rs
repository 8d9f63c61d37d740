use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use broker_proto::{ProtocolMessage, read_frame_async, write_frame_async};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dispatcher::{self, BrokerCore, ConnectionContext};
use super::queue::Delivery;
use super::rate_limiter::MessageRateLimiter;

/// Runs one client connection end to end: the read/dispatch loop, a
/// dedicated writer fed by both command responses and asynchronous queue
/// deliveries, and keep-alive/shutdown plumbing. Generalizes the teacher's
/// one-shot `handle_client` (single frame in, ACK out, return) into a
/// persistent loop, since subscribers need a long-lived socket.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    connection_id: String,
    core: Arc<BrokerCore>,
    max_message_size: u32,
    keep_alive_interval: Duration,
    auth_required: bool,
    message_rate_limiter: MessageRateLimiter,
    cancel: CancellationToken,
) {
    let (read_half, write_half) = tokio::io::split(stream);
    let (outbound_tx, outbound_rx) = mpsc::channel::<ProtocolMessage>(256);
    let (delivery_tx, delivery_rx) = mpsc::channel::<Delivery>(256);

    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(run_writer(write_half, outbound_rx, writer_cancel));

    let mut ctx = ConnectionContext::new(connection_id.clone(), auth_required);
    let result = run_read_loop(
        read_half,
        &core,
        &mut ctx,
        max_message_size,
        keep_alive_interval,
        &message_rate_limiter,
        &outbound_tx,
        &delivery_tx,
        delivery_rx,
        cancel.clone(),
    )
    .await;

    for (queue_name, subscriber_id) in ctx.subscriptions.drain() {
        if let Some(queue) = core.queues.get(&queue_name).await {
            queue.remove_subscriber(&subscriber_id);
        }
    }

    drop(outbound_tx);
    let _ = writer.await;

    match result {
        Ok(()) => debug!("connection closed: peer={peer_addr}"),
        Err(err) => info!("connection closed: peer={peer_addr}, reason={err}"),
    }
    core.metrics.connection_closed();
}

#[allow(clippy::too_many_arguments)]
async fn run_read_loop(
    mut read_half: ReadHalf<TcpStream>,
    core: &Arc<BrokerCore>,
    ctx: &mut ConnectionContext,
    max_message_size: u32,
    keep_alive_interval: Duration,
    message_rate_limiter: &MessageRateLimiter,
    outbound_tx: &mpsc::Sender<ProtocolMessage>,
    delivery_tx: &mpsc::Sender<Delivery>,
    mut delivery_rx: mpsc::Receiver<Delivery>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut keep_alive = interval(keep_alive_interval.max(Duration::from_secs(1)));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                return Ok(());
            }
            _ = keep_alive.tick() => {
                // Presence of traffic is enough; the client is expected to answer
                // `Ping` with `Pong`, but a missed beat alone doesn't drop the link.
            }
            delivery = delivery_rx.recv() => {
                match delivery {
                    Some(delivery) => {
                        // FanOutNoAck deliveries are fire-and-forget; tracking them would
                        // make every copy time out and get endlessly retried.
                        let needs_ack = core
                            .queues
                            .get(&delivery.message.queue)
                            .await
                            .map(|queue| queue.options().delivery_mode != super::options::DeliveryMode::FanOutNoAck)
                            .unwrap_or(true);
                        if needs_ack {
                            core.ack_tracker.register(
                                delivery.delivery_tag.clone(),
                                delivery.message.queue.clone(),
                                delivery.message.clone(),
                            );
                        }
                        let frame = ProtocolMessage::new(broker_proto::CommandCode::Deliver, delivery.delivery_tag)
                            .with_queue(delivery.message.queue.clone())
                            .with_payload(delivery.message.payload.clone())
                            .with_header("delivery_attempts", delivery.message.delivery_attempts.to_string());
                        if outbound_tx.send(frame).await.is_err() {
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                }
            }
            frame = read_frame_async(&mut read_half, max_message_size) => {
                let body = match frame {
                    Ok(body) => body,
                    Err(err) => {
                        return Err(anyhow::anyhow!("frame read failed: {err}"));
                    }
                };

                if !message_rate_limiter.try_consume() {
                    warn!("connection rate limited: connection={}", ctx.connection_id);
                    continue;
                }

                let message = match ProtocolMessage::decode(&body) {
                    Ok(message) => message,
                    Err(err) => {
                        return Err(anyhow::anyhow!("frame decode failed: {err}"));
                    }
                };

                let response = dispatcher::dispatch(core, ctx, message, delivery_tx).await;
                if outbound_tx.send(response).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

async fn run_writer(
    mut write_half: WriteHalf<TcpStream>,
    mut outbound_rx: mpsc::Receiver<ProtocolMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = outbound_rx.recv() => {
                let Some(message) = message else { break };
                let encoded = match message.encode() {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!("failed to encode outbound frame: error={err}");
                        continue;
                    }
                };
                if let Err(err) = write_frame_async(&mut write_half, &encoded).await {
                    warn!("failed to write outbound frame: error={err}");
                    break;
                }
            }
        }
    }
    let _ = write_half.shutdown().await;
}
