use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use broker_proto::{CommandCode, ProtocolMessage};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::ack_tracker::AckTracker;
use super::auth::Authenticator;
use super::dlq::DeadLetterQueue;
use super::error::{BrokerError, BrokerResult};
use super::message::{FailureReason, Message};
use super::metrics::Metrics;
use super::options::{BrokerOptions, DeliveryMode, OverflowStrategy, Priority};
use super::queue::Delivery;
use super::queue_manager::QueueManager;

/// Shared broker state handed to every connection. Analogous to the
/// teacher's `AppState`, just scoped to what the dispatcher needs rather than
/// the whole process (the registry/rate-limiter live alongside this in
/// `crate::app::AppState`).
pub struct BrokerCore {
    pub queues: QueueManager,
    pub dlq: Arc<DeadLetterQueue>,
    pub ack_tracker: AckTracker,
    pub auth: Authenticator,
    pub metrics: Metrics,
    pub options: BrokerOptions,
}

impl BrokerCore {
    pub fn new(options: BrokerOptions) -> Self {
        let dlq = Arc::new(DeadLetterQueue::new(options.dlq_capacity_or_default()));
        let queues = QueueManager::new(options.queue_defaults.clone(), dlq.clone());
        let auth = Authenticator::new(&options.auth);
        Self { queues, dlq, ack_tracker: AckTracker::new(), auth, metrics: Metrics::new(), options }
    }
}

/// Per-connection state the dispatcher mutates across calls: whether the
/// handshake completed, and which queues this connection is subscribed to
/// (queue name -> the subscriber id registered with that queue).
pub struct ConnectionContext {
    pub connection_id: String,
    pub authenticated: bool,
    pub subscriptions: HashMap<String, String>,
}

impl ConnectionContext {
    pub fn new(connection_id: String, auth_required: bool) -> Self {
        Self { connection_id, authenticated: !auth_required, subscriptions: HashMap::new() }
    }
}

/// Handles one decoded frame, returning the response frame to write back.
/// `Connect`/`Ping`/`Disconnect` are handled regardless of handshake state;
/// everything else requires `ctx.authenticated`.
pub async fn dispatch(
    core: &BrokerCore,
    ctx: &mut ConnectionContext,
    message: ProtocolMessage,
    delivery_tx: &mpsc::Sender<Delivery>,
) -> ProtocolMessage {
    let id = message.id.clone();
    let result = match message.command {
        CommandCode::Connect => handle_connect(core, ctx, &message),
        CommandCode::Ping => Ok(ProtocolMessage::new(CommandCode::Pong, id.clone())),
        CommandCode::Disconnect => Ok(ProtocolMessage::new(CommandCode::Disconnect, id.clone())),
        _ if !ctx.authenticated => Err(BrokerError::AuthFailed),
        CommandCode::Publish => handle_publish(core, &message).await,
        CommandCode::Subscribe => handle_subscribe(core, ctx, &message, delivery_tx).await,
        CommandCode::Unsubscribe => handle_unsubscribe(core, ctx, &message).await,
        CommandCode::Ack => handle_ack(core, &message).await,
        CommandCode::CreateQueue => handle_create_queue(core, &message).await,
        CommandCode::DeleteQueue => handle_delete_queue(core, &message).await,
        CommandCode::QueueInfo => handle_queue_info(core, &message).await,
        CommandCode::ListQueues => handle_list_queues(core, &message).await,
        CommandCode::ListDlq => handle_list_dlq(core, &message),
        CommandCode::ReplayDlq => handle_replay_dlq(core, &message).await,
        other => Err(BrokerError::InvalidMessage(format!("unexpected command from client: {other:?}"))),
    };

    match result {
        Ok(response) => response,
        Err(err) => {
            core.metrics.error_observed();
            warn!("command failed: connection={}, id={}, error={}", ctx.connection_id, id, err);
            ProtocolMessage::new(CommandCode::Error, id).with_error(err.code(), err.to_string())
        }
    }
}

fn handle_connect(core: &BrokerCore, ctx: &mut ConnectionContext, message: &ProtocolMessage) -> BrokerResult<ProtocolMessage> {
    if !core.auth.check(message.header("token")) {
        return Err(BrokerError::AuthFailed);
    }
    ctx.authenticated = true;
    info!("connection authenticated: connection={}", ctx.connection_id);
    Ok(ProtocolMessage::new(CommandCode::ConnectAck, message.id.clone()))
}

async fn handle_publish(core: &BrokerCore, message: &ProtocolMessage) -> BrokerResult<ProtocolMessage> {
    let queue_name =
        message.queue.clone().ok_or_else(|| BrokerError::InvalidMessage("publish missing queue".into()))?;
    let priority = message.header("priority").map(parse_priority).unwrap_or(Priority::Normal);
    let ttl = message.header("ttl_ms").and_then(|v| v.parse::<u64>().ok()).map(Duration::from_millis);

    let queue = core.queues.get_or_auto_create(&queue_name).await?;
    let envelope = Message::ingress(
        Some(message.id.clone()),
        queue_name.clone(),
        message.payload.clone().unwrap_or_default(),
        message.headers.clone(),
        priority,
        ttl,
    );
    let envelope_id = envelope.id.clone();

    queue.publish(envelope).await?;
    core.metrics.message_published();

    Ok(ProtocolMessage::new(CommandCode::PublishAck, envelope_id).with_queue(queue_name))
}

async fn handle_subscribe(
    core: &BrokerCore,
    ctx: &mut ConnectionContext,
    message: &ProtocolMessage,
    delivery_tx: &mpsc::Sender<Delivery>,
) -> BrokerResult<ProtocolMessage> {
    let queue_name =
        message.queue.clone().ok_or_else(|| BrokerError::InvalidMessage("subscribe missing queue".into()))?;
    let queue = core.queues.get_or_auto_create(&queue_name).await?;

    let subscriber_id = format!("{}:{}", ctx.connection_id, queue_name);
    queue.add_subscriber(subscriber_id.clone(), delivery_tx.clone());
    ctx.subscriptions.insert(queue_name.clone(), subscriber_id);

    Ok(ProtocolMessage::new(CommandCode::SubscribeAck, message.id.clone()).with_queue(queue_name))
}

async fn handle_unsubscribe(
    core: &BrokerCore,
    ctx: &mut ConnectionContext,
    message: &ProtocolMessage,
) -> BrokerResult<ProtocolMessage> {
    let queue_name =
        message.queue.clone().ok_or_else(|| BrokerError::InvalidMessage("unsubscribe missing queue".into()))?;
    if let Some(subscriber_id) = ctx.subscriptions.remove(&queue_name) {
        if let Some(queue) = core.queues.get(&queue_name).await {
            queue.remove_subscriber(&subscriber_id);
        }
    }
    Ok(ProtocolMessage::new(CommandCode::UnsubscribeAck, message.id.clone()).with_queue(queue_name))
}

/// `Ack` doubles as nack carrier: header `ack=false` means the delivery is
/// rejected and should be requeued instead of dropped. There's no dedicated
/// `Nack` command code, so this is the one place that distinction lives.
async fn handle_ack(core: &BrokerCore, message: &ProtocolMessage) -> BrokerResult<ProtocolMessage> {
    let delivery_tag = &message.id;
    let is_ack = message.header("ack").map(|v| v != "false").unwrap_or(true);

    if is_ack {
        if core.ack_tracker.ack(delivery_tag).is_some() {
            core.metrics.message_acknowledged();
        }
    } else if let Some(pending) = core.ack_tracker.nack(delivery_tag) {
        if let Some(queue) = core.queues.get(&pending.queue).await {
            queue.requeue_for_retry(pending.message)?;
            core.metrics.message_retried();
        }
    }

    Ok(ProtocolMessage::new(CommandCode::Ack, message.id.clone()))
}

async fn handle_create_queue(core: &BrokerCore, message: &ProtocolMessage) -> BrokerResult<ProtocolMessage> {
    let queue_name =
        message.queue.clone().ok_or_else(|| BrokerError::InvalidMessage("create_queue missing queue".into()))?;

    let mut options = core.options.queue_defaults.clone();
    if let Some(mode) = message.header("delivery_mode") {
        options.delivery_mode = parse_delivery_mode(mode);
    }
    if let Some(strategy) = message.header("overflow_strategy") {
        options.overflow_strategy = parse_overflow_strategy(strategy);
    }
    if let Some(max_size) = message.header("max_size").and_then(|v| v.parse().ok()) {
        options.max_size = max_size;
    }
    if let Some(ttl_ms) = message.header("ttl_ms").and_then(|v| v.parse::<u64>().ok()) {
        options.message_ttl = Some(Duration::from_millis(ttl_ms));
    }
    if let Some(retries) = message.header("max_retry_attempts").and_then(|v| v.parse().ok()) {
        options.max_retry_attempts = retries;
    }

    core.queues.create_with_options(&queue_name, options).await?;
    Ok(ProtocolMessage::new(CommandCode::CreateQueue, message.id.clone()).with_queue(queue_name))
}

async fn handle_delete_queue(core: &BrokerCore, message: &ProtocolMessage) -> BrokerResult<ProtocolMessage> {
    let queue_name =
        message.queue.clone().ok_or_else(|| BrokerError::InvalidMessage("delete_queue missing queue".into()))?;
    core.queues.delete(&queue_name).await?;
    Ok(ProtocolMessage::new(CommandCode::DeleteQueue, message.id.clone()).with_queue(queue_name))
}

async fn handle_queue_info(core: &BrokerCore, message: &ProtocolMessage) -> BrokerResult<ProtocolMessage> {
    let queue_name =
        message.queue.clone().ok_or_else(|| BrokerError::InvalidMessage("queue_info missing queue".into()))?;
    let queue = core.queues.get(&queue_name).await.ok_or_else(|| BrokerError::QueueNotFound(queue_name.clone()))?;
    let info = queue.info();

    Ok(ProtocolMessage::new(CommandCode::QueueInfo, message.id.clone())
        .with_queue(queue_name)
        .with_header("depth", info.depth.to_string())
        .with_header("subscriber_count", info.subscriber_count.to_string())
        .with_header("max_size", info.max_size.to_string()))
}

async fn handle_list_queues(core: &BrokerCore, message: &ProtocolMessage) -> BrokerResult<ProtocolMessage> {
    let names = core.queues.names().await;
    let payload = names.join("\n").into_bytes();
    Ok(ProtocolMessage::new(CommandCode::ListQueues, message.id.clone())
        .with_header("count", names.len().to_string())
        .with_payload(payload))
}

fn handle_list_dlq(core: &BrokerCore, message: &ProtocolMessage) -> BrokerResult<ProtocolMessage> {
    let queue_filter = message.header("queue");
    let reason_filter = message.header("reason").map(parse_failure_reason);
    let limit = message.header("limit").and_then(|v| v.parse().ok()).unwrap_or(100);

    let records = core.dlq.list(queue_filter, reason_filter, limit);
    let payload = records
        .iter()
        .map(|r| format!("{}|{}|{}", r.id, r.original_queue, r.reason.as_str()))
        .collect::<Vec<_>>()
        .join("\n")
        .into_bytes();

    Ok(ProtocolMessage::new(CommandCode::ListDlq, message.id.clone())
        .with_header("count", records.len().to_string())
        .with_payload(payload))
}

async fn handle_replay_dlq(core: &BrokerCore, message: &ProtocolMessage) -> BrokerResult<ProtocolMessage> {
    let record_id = &message.id;
    let mut record = core
        .dlq
        .take(record_id)
        .ok_or_else(|| BrokerError::InvalidMessage(format!("unknown dlq record: {record_id}")))?;
    record.message.reingest();

    let queue = core.queues.get_or_auto_create(&record.original_queue).await?;
    let replayed_id = record.message.id.clone();
    queue.publish(record.message).await?;

    Ok(ProtocolMessage::new(CommandCode::ReplayDlq, message.id.clone())
        .with_queue(record.original_queue)
        .with_header("replayed_id", replayed_id))
}

fn parse_priority(value: &str) -> Priority {
    match value.to_ascii_lowercase().as_str() {
        "low" => Priority::Low,
        "high" => Priority::High,
        "critical" => Priority::Critical,
        _ => Priority::Normal,
    }
}

fn parse_delivery_mode(value: &str) -> DeliveryMode {
    match value.to_ascii_lowercase().as_str() {
        "fan_out_ack" | "fanoutack" => DeliveryMode::FanOutAck,
        "fan_out_no_ack" | "fanoutnoack" => DeliveryMode::FanOutNoAck,
        "priority_based" | "prioritybased" => DeliveryMode::PriorityBased,
        _ => DeliveryMode::RoundRobin,
    }
}

fn parse_overflow_strategy(value: &str) -> OverflowStrategy {
    match value.to_ascii_lowercase().as_str() {
        "drop_newest" | "dropnewest" => OverflowStrategy::DropNewest,
        "block_publisher" | "blockpublisher" => OverflowStrategy::BlockPublisher,
        "redirect_to_dlq" | "redirecttodlq" => OverflowStrategy::RedirectToDlq,
        _ => OverflowStrategy::DropOldest,
    }
}

fn parse_failure_reason(value: &str) -> FailureReason {
    match value.to_ascii_lowercase().as_str() {
        "ttlexpired" | "ttl_expired" => FailureReason::TtlExpired,
        "deserializationerror" | "deserialization_error" => FailureReason::DeserializationError,
        "handlerrejected" | "handler_rejected" => FailureReason::HandlerRejected,
        "queueoverflow" | "queue_overflow" => FailureReason::QueueOverflow,
        _ => FailureReason::MaxRetriesExceeded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core_with_auth_disabled() -> BrokerCore {
        BrokerCore::new(BrokerOptions::default())
    }

    #[tokio::test]
    async fn connect_then_publish_then_subscribe_delivers() {
        let core = core_with_auth_disabled();
        let mut ctx = ConnectionContext::new("conn-1".to_string(), false);
        let (tx, mut rx) = mpsc::channel(8);

        let publish = ProtocolMessage::new(CommandCode::Publish, "msg-1")
            .with_queue("orders")
            .with_payload(b"hello".to_vec());
        let response = dispatch(&core, &mut ctx, publish, &tx).await;
        assert_eq!(response.command, CommandCode::PublishAck);

        let subscribe = ProtocolMessage::new(CommandCode::Subscribe, "sub-1").with_queue("orders");
        let response = dispatch(&core, &mut ctx, subscribe, &tx).await;
        assert_eq!(response.command, CommandCode::SubscribeAck);

        // The backlog from before the subscriber existed is drained on subscribe.
        let delivery = rx.try_recv().expect("delivery queued");
        assert_eq!(delivery.message.payload, b"hello");
    }

    #[tokio::test]
    async fn commands_before_auth_are_rejected() {
        let mut core = core_with_auth_disabled();
        core.auth = Authenticator::new(&super::super::options::AuthOptions {
            enabled: true,
            token: Some("secret".to_string()),
        });
        let mut ctx = ConnectionContext::new("conn-1".to_string(), true);
        let (tx, _rx) = mpsc::channel(8);

        let publish = ProtocolMessage::new(CommandCode::Publish, "msg-1").with_queue("orders");
        let response = dispatch(&core, &mut ctx, publish, &tx).await;
        assert_eq!(response.command, CommandCode::Error);
        assert_eq!(response.error_code.as_deref(), Some("AUTH_FAILED"));
    }

    #[tokio::test]
    async fn replay_dlq_republishes_and_removes_record() {
        let core = core_with_auth_disabled();
        let id = core.dlq.push(
            "orders".to_string(),
            Message::ingress(
                Some("dead-1".to_string()),
                "orders".to_string(),
                b"payload".to_vec(),
                HashMap::new(),
                Priority::Normal,
                None,
            ),
            FailureReason::TtlExpired,
        );

        let mut ctx = ConnectionContext::new("conn-1".to_string(), false);
        let (tx, _rx) = mpsc::channel(8);
        let replay = ProtocolMessage::new(CommandCode::ReplayDlq, id);
        let response = dispatch(&core, &mut ctx, replay, &tx).await;
        assert_eq!(response.command, CommandCode::ReplayDlq);
        assert!(core.dlq.is_empty());
        assert_eq!(core.queues.get("orders").await.unwrap().info().depth, 1);
    }
}
