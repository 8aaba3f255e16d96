//! Kafka messenger integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_kafka --features kafka -- --nocapture
//!
//! Uses Redpanda in dev-container mode, which auto-creates topics.

#![cfg(feature = "kafka")]

mod common;

use std::time::Duration;

use messenger::messenger::{
    ClientProperties, KafkaMessenger, KafkaMessengerConfig, AUTO_OFFSET_RESET, GROUP_ID,
};
use messenger::{Message, Messenger};
use testcontainers::{
    core::{ContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

use common::{collecting_handler, payloads, recording_handler, wait_until};

const REDPANDA_IMAGE: &str = "redpandadata/redpanda";
const REDPANDA_TAG: &str = "v24.1.1";

/// Host port for one broker, spread over 29000-29999.
fn broker_port() -> u16 {
    29000 + (uuid::Uuid::new_v4().as_u128() % 1000) as u16
}

/// Start a single-node Redpanda broker and return its bootstrap address.
///
/// Clients connect to the address the broker advertises, so the host port is
/// fixed up front and advertised as-is.
async fn start_broker() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let port = broker_port();
    let address = format!("localhost:{}", port);

    let container = GenericImage::new(REDPANDA_IMAGE, REDPANDA_TAG)
        .with_wait_for(WaitFor::message_on_stderr("Successfully started Redpanda"))
        .with_mapped_port(port, ContainerPort::Tcp(9092))
        .with_cmd([
            "redpanda",
            "start",
            "--mode",
            "dev-container",
            "--smp",
            "1",
            "--memory",
            "512M",
            "--overprovisioned",
            "--kafka-addr",
            "0.0.0.0:9092",
            "--advertise-kafka-addr",
            &address,
        ])
        .with_startup_timeout(Duration::from_secs(120))
        .start()
        .await
        .expect("Failed to start Redpanda container");

    tokio::time::sleep(Duration::from_secs(3)).await;
    println!("Broker available at {}", address);

    (container, address)
}

fn consumer_properties() -> ClientProperties {
    ClientProperties::from([
        (GROUP_ID.to_string(), format!("test-group-{}", uuid::Uuid::new_v4())),
        (AUTO_OFFSET_RESET.to_string(), "earliest".to_string()),
    ])
}

fn unique_topic(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

#[tokio::test]
async fn test_kafka_publish_and_consume() {
    println!("=== Kafka Publish and Consume Test ===");
    let (_container, bootstrap_servers) = start_broker().await;
    let topic = unique_topic("orders");

    let messenger = KafkaMessenger::new(KafkaMessengerConfig::new(&bootstrap_servers), &[&topic])
        .expect("Failed to create messenger");

    let producer = messenger.produce(&topic, None).unwrap();
    producer
        .publish(Message::keyed("k1", "{\"x\":1}").with_property("tenant", "acme"))
        .await
        .expect("Failed to publish");

    let (handler, received) = collecting_handler();
    let subscription = messenger
        .consume(&topic, Some(&consumer_properties()))
        .unwrap()
        .subscribe(handler)
        .await
        .expect("Failed to subscribe");

    wait_until(Duration::from_secs(30), || !received.lock().unwrap().is_empty()).await;

    let message = received.lock().unwrap()[0].clone();
    assert_eq!(message.payload(), "{\"x\":1}");
    assert_eq!(message.key(), Some("k1"));
    assert_eq!(message.property_str("tenant"), Some("acme"));

    subscription.shutdown().await;
    messenger.close().await.unwrap();
    println!("=== Kafka Publish and Consume Test PASSED ===");
}

#[tokio::test]
async fn test_kafka_handler_failure_commits_and_continues() {
    println!("=== Kafka Handler Failure Test ===");
    let (_container, bootstrap_servers) = start_broker().await;
    let topic = unique_topic("payments");

    let messenger = KafkaMessenger::new(KafkaMessengerConfig::new(&bootstrap_servers), &[&topic])
        .expect("Failed to create messenger");
    let producer = messenger.produce(&topic, None).unwrap();
    producer.publish(Message::keyed("p", "first")).await.unwrap();
    producer.publish(Message::keyed("p", "second")).await.unwrap();

    let (handler, received) = recording_handler(|m| m.payload() == "first");
    let subscription = messenger
        .consume(&topic, Some(&consumer_properties()))
        .unwrap()
        .subscribe(handler)
        .await
        .unwrap();

    wait_until(Duration::from_secs(30), || received.lock().unwrap().len() >= 2).await;
    assert_eq!(payloads(&received), vec!["first", "second"]);

    subscription.shutdown().await;
    messenger.close().await.unwrap();
    println!("=== Kafka Handler Failure Test PASSED ===");
}

#[tokio::test]
async fn test_kafka_publish_batch() {
    println!("=== Kafka Publish Batch Test ===");
    let (_container, bootstrap_servers) = start_broker().await;
    let topic = unique_topic("batch");

    let config = KafkaMessengerConfig::new(&bootstrap_servers).with_batch_bytes(256);
    let messenger = KafkaMessenger::new(config, &[&topic]).expect("Failed to create messenger");
    let producer = messenger.produce(&topic, None).unwrap();
    let messages = (0..10)
        .map(|i| Message::keyed("batch", format!("m{}", i)))
        .collect();
    producer
        .publish_batch(messages)
        .await
        .expect("Failed to publish batch");

    let (handler, received) = collecting_handler();
    let subscription = messenger
        .consume(&topic, Some(&consumer_properties()))
        .unwrap()
        .subscribe(handler)
        .await
        .unwrap();

    wait_until(Duration::from_secs(30), || received.lock().unwrap().len() >= 10).await;
    let mut got = payloads(&received);
    got.sort();
    let mut expected: Vec<String> = (0..10).map(|i| format!("m{}", i)).collect();
    expected.sort();
    assert_eq!(got, expected);

    subscription.shutdown().await;
    messenger.close().await.unwrap();
    println!("=== Kafka Publish Batch Test PASSED ===");
}

#[tokio::test]
async fn test_kafka_consume_without_group_fails() {
    let (_container, bootstrap_servers) = start_broker().await;
    let topic = unique_topic("nogroup");
    let messenger = KafkaMessenger::new(KafkaMessengerConfig::new(&bootstrap_servers), &[&topic])
        .expect("Failed to create messenger");

    let (handler, _received) = collecting_handler();
    let result = messenger
        .consume(&topic, None)
        .unwrap()
        .subscribe(handler)
        .await;
    assert!(result.is_err());
}
