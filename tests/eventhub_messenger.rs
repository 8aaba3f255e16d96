//! Event Hub messenger scenarios against the in-memory namespace.
//!
//! Run with: cargo test --test eventhub_messenger

mod common;

use std::sync::Arc;
use std::time::Duration;

use messenger::messenger::eventhub::{
    CheckpointStore, InMemoryCheckpointStore, InMemoryEventHubs, DEFAULT_CONSUMER_GROUP,
};
use messenger::messenger::{ClientProperties, AUTO_OFFSET_RESET, GROUP_ID};
use messenger::{init_messenger, Message, MessengerConfig};

use common::{collecting_handler, payloads, recording_handler, wait_for_count, wait_until};

fn namespace() -> (InMemoryEventHubs, Arc<InMemoryCheckpointStore>) {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let hubs = InMemoryEventHubs::with_checkpoint_store(store.clone()).with_partitions(1);
    (hubs, store)
}

fn eventhub_config() -> MessengerConfig {
    MessengerConfig::from_yaml(
        r#"
type: eventhub
topics: [orders]
eventhub:
  connection_string: "Endpoint=sb://test.servicebus.windows.net/;SharedAccessKeyName=k;SharedAccessKey=s"
  blob_container_name: checkpoints
"#,
    )
    .unwrap()
}

fn earliest() -> ClientProperties {
    ClientProperties::from([(AUTO_OFFSET_RESET.to_string(), "earliest".to_string())])
}

#[tokio::test]
async fn test_failed_handler_still_advances_checkpoint() {
    let (hubs, store) = namespace();
    let messenger = init_messenger(&eventhub_config(), Some(Arc::new(hubs.clone())))
        .await
        .unwrap();
    let producer = messenger.produce("orders", None).unwrap();
    producer.publish(Message::new("first")).await.unwrap();
    producer.publish(Message::new("second")).await.unwrap();

    let (failing, received) = recording_handler(|_| true);
    let subscription = messenger
        .consume("orders", Some(&earliest()))
        .unwrap()
        .subscribe(failing)
        .await
        .unwrap();

    wait_for_count(&received, 2).await;
    wait_until(Duration::from_secs(5), || store.update_count() >= 2).await;
    subscription.shutdown().await;

    assert_eq!(
        store
            .checkpoint("orders", DEFAULT_CONSUMER_GROUP, "0")
            .await
            .unwrap(),
        Some(1)
    );

    // A fresh processor in the same group resumes after the checkpoint.
    let (handler, redelivered) = collecting_handler();
    let subscription = messenger
        .consume("orders", Some(&earliest()))
        .unwrap()
        .subscribe(handler)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(redelivered.lock().unwrap().is_empty());

    subscription.shutdown().await;
    messenger.close().await.unwrap();
}

#[tokio::test]
async fn test_each_processed_event_checkpointed_once() {
    let (hubs, store) = namespace();
    let messenger = init_messenger(&eventhub_config(), Some(Arc::new(hubs.clone())))
        .await
        .unwrap();
    let producer = messenger.produce("Orders", None).unwrap();
    let (handler, received) = collecting_handler();
    let subscription = messenger
        .consume("orders", Some(&earliest()))
        .unwrap()
        .subscribe(handler)
        .await
        .unwrap();

    for i in 0..5 {
        producer
            .publish(Message::keyed("k", format!("m{}", i)))
            .await
            .unwrap();
    }

    wait_for_count(&received, 5).await;
    wait_until(Duration::from_secs(5), || store.update_count() >= 5).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(store.update_count(), 5);
    assert_eq!(payloads(&received), vec!["m0", "m1", "m2", "m3", "m4"]);
    assert_eq!(
        store
            .checkpoint("orders", DEFAULT_CONSUMER_GROUP, "0")
            .await
            .unwrap(),
        Some(4)
    );

    subscription.shutdown().await;
}

#[tokio::test]
async fn test_consumer_groups_track_positions_independently() {
    let (hubs, store) = namespace();
    let messenger = init_messenger(&eventhub_config(), Some(Arc::new(hubs.clone())))
        .await
        .unwrap();
    messenger
        .produce("orders", None)
        .unwrap()
        .publish(Message::new("shared"))
        .await
        .unwrap();

    let mut billing = earliest();
    billing.insert(GROUP_ID.to_string(), "billing".to_string());
    let mut shipping = earliest();
    shipping.insert(GROUP_ID.to_string(), "shipping".to_string());

    let (first, received_billing) = collecting_handler();
    let (second, received_shipping) = collecting_handler();
    let sub_billing = messenger
        .consume("orders", Some(&billing))
        .unwrap()
        .subscribe(first)
        .await
        .unwrap();
    let sub_shipping = messenger
        .consume("orders", Some(&shipping))
        .unwrap()
        .subscribe(second)
        .await
        .unwrap();

    wait_for_count(&received_billing, 1).await;
    wait_for_count(&received_shipping, 1).await;
    wait_until(Duration::from_secs(5), || store.update_count() >= 2).await;

    assert_eq!(
        store.checkpoint("orders", "billing", "0").await.unwrap(),
        Some(0)
    );
    assert_eq!(
        store.checkpoint("orders", "shipping", "0").await.unwrap(),
        Some(0)
    );

    sub_billing.shutdown().await;
    sub_shipping.shutdown().await;
}

#[tokio::test]
async fn test_eventhub_requires_connector() {
    let result = init_messenger(&eventhub_config(), None).await;
    assert!(result.is_err());
}
