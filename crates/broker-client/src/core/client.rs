use std::collections::HashMap;
use std::time::Duration;

use broker_proto::{CommandCode, ProtocolMessage, read_frame_async, write_frame_async};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{ClientError, ClientResult};
use super::subscription::{Delivery, SubscriptionHandle};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: String,
    pub token: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_message_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:7420".to_string(),
            token: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_message_size: broker_proto::DEFAULT_MAX_FRAME_LEN,
        }
    }
}

enum Outbound {
    Request { message: ProtocolMessage, respond_to: oneshot::Sender<ClientResult<ProtocolMessage>> },
    Subscribe { queue: String, delivery_tx: mpsc::Sender<Delivery>, respond_to: oneshot::Sender<ClientResult<()>> },
    Unsubscribe { queue: String },
}

/// What to do once the response to an in-flight request arrives.
enum PendingEntry {
    Request(oneshot::Sender<ClientResult<ProtocolMessage>>),
    Subscribe { queue: String, delivery_tx: mpsc::Sender<Delivery>, respond_to: oneshot::Sender<ClientResult<()>> },
}

/// A persistent client connection to the broker. A single background task
/// owns the socket, transparently reconnecting and resubscribing on
/// failure; callers never see a "disconnected" state except as a timed-out
/// request. Generalizes the teacher's per-call `send_with_retry` into a
/// long-lived connection, since this client also needs to *receive* pushed
/// deliveries, not just send-and-ack.
#[derive(Clone)]
pub struct BrokerClient {
    outbound_tx: mpsc::Sender<Outbound>,
    shutdown: CancellationToken,
}

impl BrokerClient {
    pub fn connect(config: ClientConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let shutdown = CancellationToken::new();
        tokio::spawn(run_connection_loop(config, outbound_rx, shutdown.clone()));
        Self { outbound_tx, shutdown }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn publish(
        &self,
        queue: &str,
        payload: Vec<u8>,
        priority: Option<&str>,
        ttl_ms: Option<u64>,
    ) -> ClientResult<String> {
        let mut message =
            ProtocolMessage::new(CommandCode::Publish, Uuid::now_v7().to_string()).with_queue(queue).with_payload(payload);
        if let Some(priority) = priority {
            message = message.with_header("priority", priority);
        }
        if let Some(ttl_ms) = ttl_ms {
            message = message.with_header("ttl_ms", ttl_ms.to_string());
        }
        let response = self.request(message).await?;
        Ok(response.id)
    }

    pub async fn create_queue(&self, queue: &str, headers: HashMap<String, String>) -> ClientResult<()> {
        let mut message = ProtocolMessage::new(CommandCode::CreateQueue, Uuid::now_v7().to_string()).with_queue(queue);
        for (key, value) in headers {
            message = message.with_header(key, value);
        }
        self.request(message).await.map(|_| ())
    }

    pub async fn delete_queue(&self, queue: &str) -> ClientResult<()> {
        let message = ProtocolMessage::new(CommandCode::DeleteQueue, Uuid::now_v7().to_string()).with_queue(queue);
        self.request(message).await.map(|_| ())
    }

    pub async fn list_queues(&self) -> ClientResult<Vec<String>> {
        let message = ProtocolMessage::new(CommandCode::ListQueues, Uuid::now_v7().to_string());
        let response = self.request(message).await?;
        Ok(decode_lines(&response))
    }

    pub async fn queue_info(&self, queue: &str) -> ClientResult<ProtocolMessage> {
        let message = ProtocolMessage::new(CommandCode::QueueInfo, Uuid::now_v7().to_string()).with_queue(queue);
        self.request(message).await
    }

    pub async fn list_dlq(&self, queue: Option<&str>, reason: Option<&str>, limit: usize) -> ClientResult<Vec<String>> {
        let mut message = ProtocolMessage::new(CommandCode::ListDlq, Uuid::now_v7().to_string())
            .with_header("limit", limit.to_string());
        if let Some(queue) = queue {
            message = message.with_header("queue", queue);
        }
        if let Some(reason) = reason {
            message = message.with_header("reason", reason);
        }
        let response = self.request(message).await?;
        Ok(decode_lines(&response))
    }

    pub async fn replay_dlq(&self, record_id: &str) -> ClientResult<()> {
        let message = ProtocolMessage::new(CommandCode::ReplayDlq, record_id.to_string());
        self.request(message).await.map(|_| ())
    }

    pub async fn ack(&self, delivery_tag: &str) -> ClientResult<()> {
        let message = ProtocolMessage::new(CommandCode::Ack, delivery_tag.to_string());
        self.request(message).await.map(|_| ())
    }

    pub async fn nack(&self, delivery_tag: &str) -> ClientResult<()> {
        let message = ProtocolMessage::new(CommandCode::Ack, delivery_tag.to_string()).with_header("ack", "false");
        self.request(message).await.map(|_| ())
    }

    /// Subscribes to `queue`, returning a handle whose `recv()` yields
    /// deliveries. The subscription survives reconnects: the connection
    /// loop remembers it and resends `Subscribe` after every reconnect.
    pub async fn subscribe(&self, queue: &str) -> ClientResult<SubscriptionHandle> {
        let (delivery_tx, delivery_rx) = mpsc::channel(256);
        let (respond_to, response) = oneshot::channel();
        self.outbound_tx
            .send(Outbound::Subscribe { queue: queue.to_string(), delivery_tx, respond_to })
            .await
            .map_err(|_| ClientError::Disconnected)?;
        response.await.map_err(|_| ClientError::Disconnected)??;

        Ok(SubscriptionHandle::new(queue.to_string(), delivery_rx, self.outbound_unsubscribe_sender()))
    }

    fn outbound_unsubscribe_sender(&self) -> mpsc::Sender<String> {
        let (tx, mut rx) = mpsc::channel::<String>(16);
        let outbound_tx = self.outbound_tx.clone();
        tokio::spawn(async move {
            while let Some(queue) = rx.recv().await {
                let _ = outbound_tx.send(Outbound::Unsubscribe { queue }).await;
            }
        });
        tx
    }

    async fn request(&self, message: ProtocolMessage) -> ClientResult<ProtocolMessage> {
        let (respond_to, response) = oneshot::channel();
        self.outbound_tx
            .send(Outbound::Request { message, respond_to })
            .await
            .map_err(|_| ClientError::Disconnected)?;
        let response = response.await.map_err(|_| ClientError::Disconnected)??;

        if response.command == CommandCode::Error {
            return Err(ClientError::Rejected {
                code: response.error_code.unwrap_or_default(),
                message: response.error_message.unwrap_or_default(),
            });
        }
        Ok(response)
    }
}

fn decode_lines(message: &ProtocolMessage) -> Vec<String> {
    message
        .payload
        .as_deref()
        .map(|bytes| String::from_utf8_lossy(bytes).lines().map(str::to_string).collect())
        .unwrap_or_default()
}

async fn run_connection_loop(config: ClientConfig, mut outbound_rx: mpsc::Receiver<Outbound>, shutdown: CancellationToken) {
    let mut pending: HashMap<String, PendingEntry> = HashMap::new();
    let mut subscriptions: HashMap<String, mpsc::Sender<Delivery>> = HashMap::new();
    let mut backoff = config.initial_backoff;

    'reconnect: loop {
        if shutdown.is_cancelled() {
            return;
        }

        let (read_half, mut write_half) = match connect_and_handshake(&config).await {
            Ok(halves) => {
                backoff = config.initial_backoff;
                halves
            }
            Err(err) => {
                warn!("broker connect failed: server={}, error={err}", config.server);
                fail_all_pending(&mut pending);
                sleep(backoff).await;
                backoff = (backoff * 2).min(config.max_backoff);
                continue 'reconnect;
            }
        };

        for queue in subscriptions.keys() {
            let subscribe = ProtocolMessage::new(CommandCode::Subscribe, Uuid::now_v7().to_string()).with_queue(queue.clone());
            if let Ok(encoded) = subscribe.encode() {
                let _ = write_frame_async(&mut write_half, &encoded).await;
            }
        }

        let mut read_half = read_half;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = write_half.shutdown().await;
                    return;
                }
                outbound = outbound_rx.recv() => {
                    let Some(outbound) = outbound else {
                        let _ = write_half.shutdown().await;
                        return;
                    };
                    if !handle_outbound(outbound, &mut write_half, &mut pending).await {
                        fail_all_pending(&mut pending);
                        continue 'reconnect;
                    }
                }
                frame = read_frame_async(&mut read_half, config.max_message_size) => {
                    match frame {
                        Ok(body) => {
                            if let Err(err) = handle_incoming(&body, &mut pending, &mut subscriptions).await {
                                warn!("failed to decode broker frame: error={err}");
                            }
                        }
                        Err(err) => {
                            debug!("broker connection read failed: error={err}");
                            fail_all_pending(&mut pending);
                            continue 'reconnect;
                        }
                    }
                }
            }
        }
    }
}

async fn connect_and_handshake(
    config: &ClientConfig,
) -> anyhow::Result<(ReadHalf<TcpStream>, WriteHalf<TcpStream>)> {
    let stream = timeout(config.connect_timeout, TcpStream::connect(&config.server)).await??;
    stream.set_nodelay(true).ok();
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let mut connect = ProtocolMessage::new(CommandCode::Connect, Uuid::now_v7().to_string());
    if let Some(token) = &config.token {
        connect = connect.with_header("token", token.clone());
    }
    let encoded = connect.encode()?;
    timeout(config.connect_timeout, write_frame_async(&mut write_half, &encoded)).await??;

    let body = timeout(config.connect_timeout, read_frame_async(&mut read_half, config.max_message_size)).await??;
    let response = ProtocolMessage::decode(&body)?;
    if response.command != CommandCode::ConnectAck {
        anyhow::bail!("handshake rejected: {:?}", response.error_message);
    }

    info!("broker connected: server={}", config.server);
    Ok((read_half, write_half))
}

/// Writes one outbound command to the socket, registering it in `pending`
/// (or `subscriptions`) as appropriate. Returns `false` if the write failed
/// and the caller should reconnect.
async fn handle_outbound(
    outbound: Outbound,
    write_half: &mut WriteHalf<TcpStream>,
    pending: &mut HashMap<String, PendingEntry>,
) -> bool {
    match outbound {
        Outbound::Request { message, respond_to } => {
            let encoded = match message.encode() {
                Ok(encoded) => encoded,
                Err(err) => {
                    let _ = respond_to.send(Err(ClientError::Protocol(err)));
                    return true;
                }
            };
            if write_frame_async(write_half, &encoded).await.is_err() {
                let _ = respond_to.send(Err(ClientError::Disconnected));
                return false;
            }
            pending.insert(message.id, PendingEntry::Request(respond_to));
            true
        }
        Outbound::Subscribe { queue, delivery_tx, respond_to } => {
            let id = Uuid::now_v7().to_string();
            let message = ProtocolMessage::new(CommandCode::Subscribe, id.clone()).with_queue(queue.clone());
            let Ok(encoded) = message.encode() else {
                let _ = respond_to.send(Err(ClientError::Disconnected));
                return true;
            };
            if write_frame_async(write_half, &encoded).await.is_err() {
                let _ = respond_to.send(Err(ClientError::Disconnected));
                return false;
            }
            pending.insert(id, PendingEntry::Subscribe { queue, delivery_tx, respond_to });
            true
        }
        Outbound::Unsubscribe { queue } => {
            let message = ProtocolMessage::new(CommandCode::Unsubscribe, Uuid::now_v7().to_string()).with_queue(queue);
            if let Ok(encoded) = message.encode() {
                let _ = write_frame_async(write_half, &encoded).await;
            }
            true
        }
    }
}

async fn handle_incoming(
    body: &[u8],
    pending: &mut HashMap<String, PendingEntry>,
    subscriptions: &mut HashMap<String, mpsc::Sender<Delivery>>,
) -> ClientResult<()> {
    let message = ProtocolMessage::decode(body)?;

    if message.command == CommandCode::Deliver {
        if let Some(queue) = &message.queue {
            if let Some(sender) = subscriptions.get(queue) {
                let delivery_attempts =
                    message.header("delivery_attempts").and_then(|v| v.parse().ok()).unwrap_or(0);
                let delivery = Delivery {
                    delivery_tag: message.id,
                    queue: queue.clone(),
                    payload: message.payload.unwrap_or_default(),
                    delivery_attempts,
                };
                let _ = sender.send(delivery).await;
            }
        }
        return Ok(());
    }

    let Some(entry) = pending.remove(&message.id) else {
        return Ok(());
    };

    match entry {
        PendingEntry::Request(respond_to) => {
            let _ = respond_to.send(Ok(message));
        }
        PendingEntry::Subscribe { queue, delivery_tx, respond_to } => {
            if message.command == CommandCode::Error {
                let _ = respond_to.send(Err(ClientError::Rejected {
                    code: message.error_code.unwrap_or_default(),
                    message: message.error_message.unwrap_or_default(),
                }));
            } else {
                subscriptions.insert(queue, delivery_tx);
                let _ = respond_to.send(Ok(()));
            }
        }
    }
    Ok(())
}

/// On disconnect, an unresolved `Unsubscribe` has no one waiting on it, so
/// only `Request` and `Subscribe` entries need to be failed; `subscriptions`
/// itself is untouched so the next successful reconnect resubscribes them.
fn fail_all_pending(pending: &mut HashMap<String, PendingEntry>) {
    for (_, entry) in pending.drain() {
        match entry {
            PendingEntry::Request(respond_to) => {
                let _ = respond_to.send(Err(ClientError::Disconnected));
            }
            PendingEntry::Subscribe { respond_to, .. } => {
                let _ = respond_to.send(Err(ClientError::Disconnected));
            }
        }
    }
}
