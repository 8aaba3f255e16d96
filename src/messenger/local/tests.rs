use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;

use opentelemetry::trace::TraceContextExt;

use super::*;
use crate::messenger::{handler_fn, BoxError};
use crate::test_utils::{collecting_handler, wait_for_count};

#[tokio::test]
async fn test_publish_then_receive() {
    let messenger = LocalMessenger::new(&["orders"]).unwrap();
    let (handler, received) = collecting_handler();
    let subscription = messenger
        .consume("orders", None)
        .unwrap()
        .subscribe(handler)
        .await
        .unwrap();

    let before = Utc::now();
    messenger
        .produce("orders", None)
        .unwrap()
        .publish(Message::keyed("k1", "hello"))
        .await
        .unwrap();

    wait_for_count(&received, 1).await;
    let messages = received.lock().unwrap().clone();
    assert_eq!(messages[0].payload(), "hello");
    assert_eq!(messages[0].key(), Some("k1"));
    assert!(messages[0].timestamp() >= before);

    subscription.shutdown().await;
}

#[tokio::test]
async fn test_competing_consumers_receive_each_message_once() {
    let messenger = LocalMessenger::new(&["work"]).unwrap();
    let consumer = messenger.consume("work", None).unwrap();
    let (first, received_first) = collecting_handler();
    let (second, received_second) = collecting_handler();
    let sub_a = consumer.subscribe(first).await.unwrap();
    let sub_b = consumer.subscribe(second).await.unwrap();

    let producer = messenger.produce("work", None).unwrap();
    for i in 0..20 {
        producer.publish(Message::new(format!("m{}", i))).await.unwrap();
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let total = received_first.lock().unwrap().len() + received_second.lock().unwrap().len();
            if total >= 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let mut payloads: Vec<String> = received_first
        .lock()
        .unwrap()
        .iter()
        .chain(received_second.lock().unwrap().iter())
        .map(|m| m.payload().to_string())
        .collect();
    payloads.sort();
    payloads.dedup();
    assert_eq!(payloads.len(), 20);

    sub_a.shutdown().await;
    sub_b.shutdown().await;
}

#[tokio::test]
async fn test_bounded_channel_applies_backpressure() {
    let messenger = LocalMessenger::with_capacity(&["orders"], 1).unwrap();
    let producer = messenger.produce("orders", None).unwrap();

    producer.publish(Message::new("first")).await.unwrap();
    let blocked =
        tokio::time::timeout(Duration::from_millis(100), producer.publish(Message::new("second")))
            .await;

    assert!(blocked.is_err());
}

#[tokio::test]
async fn test_unknown_topic_is_rejected() {
    let messenger = LocalMessenger::new(&["orders"]).unwrap();
    assert!(matches!(
        messenger.produce("invoices", None),
        Err(MessengerError::UnknownTopic(_))
    ));
    assert!(matches!(
        messenger.consume("invoices", None),
        Err(MessengerError::UnknownTopic(_))
    ));
}

#[tokio::test]
async fn test_close_is_idempotent_and_stops_consumers() {
    let messenger = LocalMessenger::new(&["orders"]).unwrap();
    let producer = messenger.produce("orders", None).unwrap();
    let (handler, _received) = collecting_handler();
    let subscription = messenger
        .consume("orders", None)
        .unwrap()
        .subscribe(handler)
        .await
        .unwrap();

    messenger.close().await.unwrap();
    messenger.close().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), subscription.stopped())
        .await
        .unwrap();
    assert!(matches!(
        producer.publish(Message::new("late")).await,
        Err(MessengerError::Closed)
    ));
    assert!(matches!(
        messenger.produce("orders", None),
        Err(MessengerError::Closed)
    ));
}

#[tokio::test]
async fn test_requeue_policy_redelivers() {
    let messenger = LocalMessenger::new(&["orders"])
        .unwrap()
        .with_failure_policy(FailurePolicy::RequeueWithDelay(Duration::from_millis(20)));
    let attempts = Arc::new(AtomicUsize::new(0));
    let handler = {
        let attempts = Arc::clone(&attempts);
        handler_fn(move |_message: Message, _token| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    return Err(BoxError::from("first attempt fails"));
                }
                Ok::<(), BoxError>(())
            }
        })
    };
    let subscription = messenger
        .consume("orders", None)
        .unwrap()
        .subscribe(handler)
        .await
        .unwrap();

    messenger
        .produce("orders", None)
        .unwrap()
        .publish(Message::new("retry-me"))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while attempts.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    subscription.shutdown().await;
}

#[tokio::test]
async fn test_receiver_resumes_trace_context_from_properties() {
    let messenger = LocalMessenger::new(&["orders"]).unwrap();
    let receiver = LocalReceiver {
        channel: messenger.channel("orders").unwrap(),
        shared: Arc::clone(&messenger.shared),
    };
    let message = Message::new("traced").with_property(
        "traceparent",
        "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
    );

    let cx = receiver.parent_context(&message);

    assert_eq!(
        cx.span().span_context().trace_id().to_string(),
        "4bf92f3577b34da6a3ce929d0e0e4736"
    );
}

#[tokio::test]
async fn test_publish_keeps_custom_properties() {
    let messenger = LocalMessenger::new(&["orders"]).unwrap();
    let seen = Arc::new(StdMutex::new(None));
    let handler = {
        let seen = Arc::clone(&seen);
        handler_fn(move |message: Message, _token| {
            *seen.lock().unwrap() = message.property_str("tenant").map(str::to_string);
            async { Ok::<(), BoxError>(()) }
        })
    };
    let subscription = messenger
        .consume("orders", None)
        .unwrap()
        .subscribe(handler)
        .await
        .unwrap();

    messenger
        .produce("orders", None)
        .unwrap()
        .publish(Message::new("p").with_property("tenant", "acme"))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while seen.lock().unwrap().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(seen.lock().unwrap().as_deref(), Some("acme"));

    subscription.shutdown().await;
}

#[tokio::test]
async fn test_trace_and_baggage_flow_from_publisher_span_to_handler() {
    use opentelemetry::baggage::BaggageExt;
    use opentelemetry::trace::{TraceId, TracerProvider as _};
    use opentelemetry::KeyValue;
    use tracing_opentelemetry::OpenTelemetrySpanExt;
    use tracing_subscriber::layer::SubscriberExt;

    let provider = opentelemetry_sdk::trace::TracerProvider::builder().build();
    let subscriber = tracing_subscriber::registry()
        .with(tracing_opentelemetry::layer().with_tracer(provider.tracer("messenger-test")));
    let _default = tracing::subscriber::set_default(subscriber);

    let messenger = LocalMessenger::new(&["orders"]).unwrap();
    let seen: Arc<StdMutex<Option<(TraceId, Option<String>)>>> = Arc::new(StdMutex::new(None));
    let handler = {
        let seen = Arc::clone(&seen);
        handler_fn(move |_message: Message, _token: CancellationToken| {
            let seen = Arc::clone(&seen);
            async move {
                let trace_id = tracing::Span::current()
                    .context()
                    .span()
                    .span_context()
                    .trace_id();
                let tenant = Context::current()
                    .baggage()
                    .get("tenant")
                    .map(|v| v.to_string());
                *seen.lock().unwrap() = Some((trace_id, tenant));
                Ok::<(), BoxError>(())
            }
        })
    };
    let subscription = messenger
        .consume("orders", None)
        .unwrap()
        .subscribe(handler)
        .await
        .unwrap();

    // The baggage is current only while the span is created, not while the loop runs.
    let checkout = {
        let _baggage =
            Context::current_with_baggage(vec![KeyValue::new("tenant", "acme")]).attach();
        tracing::info_span!("checkout")
    };
    let expected = checkout.context().span().span_context().trace_id();
    assert_ne!(expected, TraceId::INVALID);

    messenger
        .produce("orders", None)
        .unwrap()
        .publish(Message::new("traced"))
        .instrument(checkout)
        .await
        .unwrap();

    crate::test_utils::wait_until(|| seen.lock().unwrap().is_some()).await;
    let (trace_id, tenant) = seen.lock().unwrap().clone().unwrap();
    assert_eq!(trace_id, expected);
    assert_eq!(tenant.as_deref(), Some("acme"));

    subscription.shutdown().await;
}
