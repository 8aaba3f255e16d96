use super::*;
use crate::messenger::{handler_fn, BoxError, AUTO_OFFSET_RESET};
use crate::test_utils::{collecting_handler, failing_handler, payloads, wait_for_count, wait_until};

fn single_partition() -> (InMemoryEventHubs, Arc<InMemoryCheckpointStore>) {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let hubs = InMemoryEventHubs::with_checkpoint_store(store.clone()).with_partitions(1);
    (hubs, store)
}

async fn connect(hubs: &InMemoryEventHubs, topics: &[&str]) -> HubMessenger {
    HubMessenger::connect(EventHubConfig::default(), topics, Arc::new(hubs.clone()))
        .await
        .unwrap()
}

fn earliest() -> ClientProperties {
    ClientProperties::from([(AUTO_OFFSET_RESET.to_string(), "earliest".to_string())])
}

#[tokio::test]
async fn test_topics_share_one_sender_regardless_of_case() {
    let (hubs, _store) = single_partition();
    let messenger = connect(&hubs, &["Orders", "orders"]).await;

    assert_eq!(hubs.senders_created(), 1);
    assert_eq!(messenger.topics(), &["orders".to_string()]);

    messenger
        .produce("Orders", None)
        .unwrap()
        .publish(Message::new("a"))
        .await
        .unwrap();
    messenger
        .produce("orders", None)
        .unwrap()
        .publish(Message::new("b"))
        .await
        .unwrap();

    assert_eq!(hubs.events("orders").unwrap().len(), 2);
}

#[tokio::test]
async fn test_publish_maps_key_and_properties() {
    let (hubs, _store) = single_partition();
    let messenger = connect(&hubs, &["orders"]).await;

    messenger
        .produce("orders", None)
        .unwrap()
        .publish(Message::keyed("k1", "{\"x\":1}").with_property("tenant", "acme"))
        .await
        .unwrap();

    let events = hubs.events("orders").unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data.partition_key.as_deref(), Some("k1"));
    assert_eq!(&events[0].data.body[..], b"{\"x\":1}");
    assert_eq!(
        events[0].data.properties.get("tenant").and_then(|v| v.as_str()),
        Some("acme")
    );
}

#[tokio::test]
async fn test_success_checkpoints_in_default_group() {
    let (hubs, store) = single_partition();
    let messenger = connect(&hubs, &["orders"]).await;
    let producer = messenger.produce("orders", None).unwrap();
    producer.publish(Message::keyed("k1", "first")).await.unwrap();

    let (handler, received) = collecting_handler();
    let subscription = messenger
        .consume("orders", Some(&earliest()))
        .unwrap()
        .subscribe(handler)
        .await
        .unwrap();

    wait_for_count(&received, 1).await;
    wait_until(|| store.update_count() >= 1).await;

    let message = received.lock().unwrap()[0].clone();
    assert_eq!(message.payload(), "first");
    assert_eq!(message.key(), Some("k1"));
    assert_eq!(
        store.checkpoint("orders", DEFAULT_CONSUMER_GROUP, "0").await.unwrap(),
        Some(0)
    );

    subscription.shutdown().await;
}

#[tokio::test]
async fn test_latest_start_skips_existing_events() {
    let (hubs, _store) = single_partition();
    let messenger = connect(&hubs, &["orders"]).await;
    let producer = messenger.produce("orders", None).unwrap();
    producer.publish(Message::new("before")).await.unwrap();

    let (handler, received) = collecting_handler();
    let subscription = messenger
        .consume("orders", None)
        .unwrap()
        .subscribe(handler)
        .await
        .unwrap();
    producer.publish(Message::new("after")).await.unwrap();

    wait_for_count(&received, 1).await;
    assert_eq!(payloads(&received), vec!["after"]);

    subscription.shutdown().await;
}

#[tokio::test]
async fn test_group_id_property_selects_consumer_group() {
    let (hubs, store) = single_partition();
    let messenger = connect(&hubs, &["orders"]).await;
    messenger
        .produce("orders", None)
        .unwrap()
        .publish(Message::new("m"))
        .await
        .unwrap();

    let mut properties = earliest();
    properties.insert(GROUP_ID.to_string(), "billing".to_string());
    let (handler, received) = collecting_handler();
    let subscription = messenger
        .consume("orders", Some(&properties))
        .unwrap()
        .subscribe(handler)
        .await
        .unwrap();

    wait_for_count(&received, 1).await;
    wait_until(|| store.update_count() >= 1).await;

    assert_eq!(store.checkpoint("orders", "billing", "0").await.unwrap(), Some(0));
    assert_eq!(
        store.checkpoint("orders", DEFAULT_CONSUMER_GROUP, "0").await.unwrap(),
        None
    );

    subscription.shutdown().await;
}

#[tokio::test]
async fn test_requeue_policy_leaves_checkpoint_behind() {
    let (hubs, store) = single_partition();
    let messenger = connect(&hubs, &["orders"])
        .await
        .with_failure_policy(FailurePolicy::RequeueWithDelay(Duration::from_millis(10)));
    messenger
        .produce("orders", None)
        .unwrap()
        .publish(Message::new("fails"))
        .await
        .unwrap();

    let (handler, received) = failing_handler(|_| true);
    let consumer = messenger.consume("orders", Some(&earliest())).unwrap();
    let subscription = consumer.subscribe(handler).await.unwrap();
    wait_for_count(&received, 1).await;
    subscription.shutdown().await;

    assert_eq!(store.update_count(), 0);

    // A restarted processor reads the un-checkpointed event again.
    let (handler, received) = collecting_handler();
    let subscription = consumer.subscribe(handler).await.unwrap();
    wait_for_count(&received, 1).await;
    assert_eq!(payloads(&received), vec!["fails"]);

    subscription.shutdown().await;
}

#[tokio::test]
async fn test_undecodable_event_is_checkpointed_and_skipped() {
    let (hubs, store) = single_partition();
    let messenger = connect(&hubs, &["orders"]).await;
    let sender = hubs.sender("orders").await.unwrap();
    sender
        .send(vec![EventData {
            body: Bytes::from_static(&[0xff, 0xfe, 0xfd]),
            partition_key: None,
            properties: Default::default(),
        }])
        .await
        .unwrap();
    messenger
        .produce("orders", None)
        .unwrap()
        .publish(Message::new("valid"))
        .await
        .unwrap();

    let (handler, received) = collecting_handler();
    let subscription = messenger
        .consume("orders", Some(&earliest()))
        .unwrap()
        .subscribe(handler)
        .await
        .unwrap();

    wait_for_count(&received, 1).await;
    wait_until(|| store.update_count() >= 2).await;
    assert_eq!(payloads(&received), vec!["valid"]);

    subscription.shutdown().await;
}

#[tokio::test]
async fn test_publish_batch_splits_to_batch_limit() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let hubs = InMemoryEventHubs::with_checkpoint_store(store)
        .with_partitions(1)
        .with_max_batch_bytes(16);
    let messenger = connect(&hubs, &["orders"]).await;

    let messages = (0..6).map(|i| Message::new(format!("payload-{}", i))).collect();
    messenger
        .produce("orders", None)
        .unwrap()
        .publish_batch(messages)
        .await
        .unwrap();

    let bodies: Vec<Vec<u8>> = hubs
        .events("orders")
        .unwrap()
        .into_iter()
        .map(|e| e.data.body.to_vec())
        .collect();
    let expected: Vec<Vec<u8>> = (0..6).map(|i| format!("payload-{}", i).into_bytes()).collect();
    assert_eq!(bodies, expected);
}

#[tokio::test]
async fn test_second_processor_in_group_waits_for_partitions() {
    let (hubs, _store) = single_partition();
    let messenger = connect(&hubs, &["orders"]).await;
    let consumer = messenger.consume("orders", Some(&earliest())).unwrap();

    let (first, received_first) = collecting_handler();
    let (second, received_second) = collecting_handler();
    let sub_a = consumer.subscribe(first).await.unwrap();
    let sub_b = consumer.subscribe(second).await.unwrap();

    messenger
        .produce("orders", None)
        .unwrap()
        .publish(Message::new("only-once"))
        .await
        .unwrap();

    wait_for_count(&received_first, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(received_second.lock().unwrap().is_empty());

    sub_a.shutdown().await;
    sub_b.shutdown().await;
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (hubs, _store) = single_partition();
    let messenger = connect(&hubs, &["orders"]).await;
    let producer = messenger.produce("orders", None).unwrap();

    messenger.close().await.unwrap();
    messenger.close().await.unwrap();

    assert!(matches!(
        producer.publish(Message::new("late")).await,
        Err(MessengerError::Closed)
    ));
    assert!(matches!(
        messenger.consume("orders", None),
        Err(MessengerError::Closed)
    ));
}

#[tokio::test]
async fn test_handler_receives_subscription_token() {
    let (hubs, _store) = single_partition();
    let messenger = connect(&hubs, &["orders"]).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let handler = handler_fn(move |_message: Message, token: CancellationToken| {
        let tx = tx.clone();
        async move {
            tx.send(token).map_err(|_| BoxError::from("test receiver gone"))?;
            Ok::<(), BoxError>(())
        }
    });
    let subscription = messenger
        .consume("orders", None)
        .unwrap()
        .subscribe(handler)
        .await
        .unwrap();
    messenger
        .produce("orders", None)
        .unwrap()
        .publish(Message::new("m"))
        .await
        .unwrap();

    let token = rx.recv().await.unwrap();
    assert!(!token.is_cancelled());
    subscription.shutdown().await;
    assert!(token.is_cancelled());
}
