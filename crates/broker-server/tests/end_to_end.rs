use std::time::Duration;

use broker_client::{BrokerClient, ClientConfig};
use broker_server::app::AppState;
use broker_server::config::Config;
use broker_server::core::run_tcp_server;
use tokio::net::TcpListener;
use tokio::time::sleep;

/// Binds to the given address just long enough to confirm it is free,
/// mirroring the bind-or-skip pattern the teacher's client tests use for
/// network-dependent assertions in restricted sandboxes.
async fn bind_or_skip(addr: &str) -> bool {
    match TcpListener::bind(addr).await {
        Ok(_listener) => true,
        Err(err) => {
            eprintln!("skipping network test: {err}");
            false
        }
    }
}

#[tokio::test]
async fn publish_then_subscribe_round_trips_a_delivery() {
    let addr = "127.0.0.1:17421";
    if !bind_or_skip(addr).await {
        return;
    }

    let mut config = Config::default();
    config.listen = addr.to_string();
    let options = config.to_broker_options().expect("valid options");
    let state = AppState::new(options);
    let shutdown = state.shutdown.clone();

    let server = tokio::spawn(run_tcp_server(addr, state));
    sleep(Duration::from_millis(50)).await;

    let client = BrokerClient::connect(ClientConfig { server: addr.to_string(), ..ClientConfig::default() });

    let mut subscription = client.subscribe("orders").await.expect("subscribe should succeed");
    client.publish("orders", b"hello".to_vec(), None, None).await.expect("publish should succeed");

    let delivery = tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .expect("delivery should arrive")
        .expect("channel should stay open");
    assert_eq!(delivery.queue, "orders");
    assert_eq!(delivery.payload, b"hello");

    client.ack(&delivery.delivery_tag).await.expect("ack should succeed");

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), server).await;
}

#[tokio::test]
async fn nack_redelivers_the_message() {
    let addr = "127.0.0.1:17423";
    if !bind_or_skip(addr).await {
        return;
    }

    let mut config = Config::default();
    config.listen = addr.to_string();
    let options = config.to_broker_options().expect("valid options");
    let state = AppState::new(options);
    let shutdown = state.shutdown.clone();

    let server = tokio::spawn(run_tcp_server(addr, state));
    sleep(Duration::from_millis(50)).await;

    let client = BrokerClient::connect(ClientConfig { server: addr.to_string(), ..ClientConfig::default() });

    let mut subscription = client.subscribe("retries").await.expect("subscribe should succeed");
    client.publish("retries", b"retry-me".to_vec(), None, None).await.expect("publish should succeed");

    let first = tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .expect("first delivery should arrive")
        .expect("channel should stay open");
    assert_eq!(first.delivery_attempts, 0);

    client.nack(&first.delivery_tag).await.expect("nack should succeed");

    let redelivered = tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .expect("redelivery should arrive")
        .expect("channel should stay open");
    assert_eq!(redelivered.payload, b"retry-me");
    assert_eq!(redelivered.delivery_attempts, 1);

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), server).await;
}

#[tokio::test]
async fn create_queue_then_list_queues_reflects_it() {
    let addr = "127.0.0.1:17422";
    if !bind_or_skip(addr).await {
        return;
    }

    let mut config = Config::default();
    config.listen = addr.to_string();
    let options = config.to_broker_options().expect("valid options");
    let state = AppState::new(options);
    let shutdown = state.shutdown.clone();

    let server = tokio::spawn(run_tcp_server(addr, state));
    sleep(Duration::from_millis(50)).await;

    let client = BrokerClient::connect(ClientConfig { server: addr.to_string(), ..ClientConfig::default() });
    client.create_queue("payments", Default::default()).await.expect("create-queue should succeed");

    let queues = client.list_queues().await.expect("list-queues should succeed");
    assert!(queues.contains(&"payments".to_string()));

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), server).await;
}
