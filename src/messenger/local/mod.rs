//! In-process channel messenger.
//!
//! One tokio `mpsc` channel per declared topic, created up front. Producers
//! write, consumers compete for reads. Reading a message is its ack, so the
//! only redelivery is an explicit requeue. Nothing survives a restart.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::Context;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

use super::consumer::{spawn_loops, LoopConfig};
use super::{
    publish_span, record_publish, Backend, ClientProperties, CloseFlag, Consumer,
    FailurePolicy, Message, MessageHandler, Messenger, MessengerError, Producer, Receiver,
    Result, Subscription, TopicMap, TracePropagator,
};

/// Backend settings shared by every channel of a messenger.
struct Shared {
    closed: CloseFlag,
    shutdown: CancellationToken,
    propagator: TracePropagator,
}

enum ChannelSender {
    Unbounded(mpsc::UnboundedSender<Message>),
    Bounded(mpsc::Sender<Message>),
}

enum ChannelReceiver {
    Unbounded(mpsc::UnboundedReceiver<Message>),
    Bounded(mpsc::Receiver<Message>),
}

impl ChannelReceiver {
    async fn recv(&mut self) -> Option<Message> {
        match self {
            ChannelReceiver::Unbounded(rx) => rx.recv().await,
            ChannelReceiver::Bounded(rx) => rx.recv().await,
        }
    }
}

/// One topic's channel.
struct LocalChannel {
    topic: String,
    sender: ChannelSender,
    receiver: Mutex<ChannelReceiver>,
}

impl LocalChannel {
    fn new(topic: &str, capacity: Option<usize>) -> Self {
        let (sender, receiver) = match capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (ChannelSender::Bounded(tx), ChannelReceiver::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (ChannelSender::Unbounded(tx), ChannelReceiver::Unbounded(rx))
            }
        };
        Self {
            topic: topic.to_string(),
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    /// Enqueue; waits for capacity on a bounded channel.
    async fn send(&self, message: Message) -> Result<()> {
        match &self.sender {
            ChannelSender::Unbounded(tx) => tx.send(message).map_err(|_| MessengerError::Closed),
            ChannelSender::Bounded(tx) => {
                tx.send(message).await.map_err(|_| MessengerError::Closed)
            }
        }
    }
}

/// Messenger over in-process channels.
///
/// Unbounded by default; `with_capacity` applies backpressure to publishers
/// once a topic holds `capacity` unconsumed messages.
pub struct LocalMessenger {
    channels: TopicMap<Arc<LocalChannel>>,
    shared: Arc<Shared>,
    policy: FailurePolicy,
}

impl LocalMessenger {
    /// Create unbounded channels for `topics`.
    pub fn new<S: AsRef<str>>(topics: &[S]) -> Result<Self> {
        Self::build(topics, None)
    }

    /// Create bounded channels for `topics`.
    pub fn with_capacity<S: AsRef<str>>(topics: &[S], capacity: usize) -> Result<Self> {
        Self::build(topics, Some(capacity))
    }

    /// Replace the failure policy applied by consumers created afterwards.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    fn build<S: AsRef<str>>(topics: &[S], capacity: Option<usize>) -> Result<Self> {
        let channels = TopicMap::build(topics, |name| {
            Ok(Arc::new(LocalChannel::new(name, capacity)))
        })?;

        info!(
            topics = ?channels.names(),
            capacity = ?capacity,
            "Local messenger initialized"
        );

        Ok(Self {
            channels,
            shared: Arc::new(Shared {
                closed: CloseFlag::default(),
                shutdown: CancellationToken::new(),
                propagator: TracePropagator::new(),
            }),
            policy: FailurePolicy::SuppressAndAck,
        })
    }

    fn channel(&self, topic: &str) -> Result<Arc<LocalChannel>> {
        self.shared.closed.ensure_open()?;
        self.channels.get(topic).cloned()
    }
}

#[async_trait]
impl Messenger for LocalMessenger {
    fn backend(&self) -> Backend {
        Backend::Local
    }

    fn topics(&self) -> &[String] {
        self.channels.names()
    }

    fn produce(
        &self,
        topic: &str,
        _properties: Option<&ClientProperties>,
    ) -> Result<Arc<dyn Producer>> {
        Ok(Arc::new(LocalProducer {
            channel: self.channel(topic)?,
            shared: Arc::clone(&self.shared),
        }))
    }

    fn consume(
        &self,
        topic: &str,
        _properties: Option<&ClientProperties>,
    ) -> Result<Arc<dyn Consumer>> {
        Ok(Arc::new(LocalConsumer {
            channel: self.channel(topic)?,
            shared: Arc::clone(&self.shared),
            policy: self.policy,
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.shared.closed.close() {
            self.shared.shutdown.cancel();
            info!("Local messenger closed");
        }
        Ok(())
    }
}

// ============================================================================
// Producer
// ============================================================================

struct LocalProducer {
    channel: Arc<LocalChannel>,
    shared: Arc<Shared>,
}

#[async_trait]
impl Producer for LocalProducer {
    fn topic(&self) -> &str {
        &self.channel.topic
    }

    async fn publish(&self, message: Message) -> Result<()> {
        self.shared.closed.ensure_open()?;

        let span = publish_span(Backend::Local, &self.channel.topic, message.key());
        let started = Instant::now();

        let result = async {
            let mut properties = message.properties().clone();
            self.shared.propagator.prepare_current(&mut properties);
            let message = message
                .with_properties(properties)
                .with_timestamp(Utc::now());
            self.channel.send(message).await
        }
        .instrument(span.clone())
        .await;

        record_publish(&span, Backend::Local, &self.channel.topic, started, &result);
        result
    }
}

// ============================================================================
// Consumer
// ============================================================================

struct LocalConsumer {
    channel: Arc<LocalChannel>,
    shared: Arc<Shared>,
    policy: FailurePolicy,
}

#[async_trait]
impl Consumer for LocalConsumer {
    fn topic(&self) -> &str {
        &self.channel.topic
    }

    async fn subscribe_until(
        &self,
        handler: Arc<dyn MessageHandler>,
        parent: &CancellationToken,
    ) -> Result<Subscription> {
        self.shared.closed.ensure_open()?;

        let receiver = LocalReceiver {
            channel: Arc::clone(&self.channel),
            shared: Arc::clone(&self.shared),
        };
        let config = LoopConfig {
            backend: Backend::Local,
            topic: self.channel.topic.clone(),
            policy: self.policy,
            handler,
        };

        debug!(topic = %self.channel.topic, "Subscribing to local channel");
        Ok(spawn_loops(config, vec![receiver], parent))
    }
}

struct LocalReceiver {
    channel: Arc<LocalChannel>,
    shared: Arc<Shared>,
}

#[async_trait]
impl Receiver for LocalReceiver {
    type Delivery = Message;
    type Item = Message;

    async fn receive(&mut self) -> Result<Option<Message>> {
        let mut receiver = tokio::select! {
            _ = self.shared.shutdown.cancelled() => return Err(MessengerError::Closed),
            guard = self.channel.receiver.lock() => guard,
        };
        tokio::select! {
            _ = self.shared.shutdown.cancelled() => Err(MessengerError::Closed),
            message = receiver.recv() => message.map(Some).ok_or(MessengerError::Closed),
        }
    }

    fn decode(&self, delivery: &Message) -> Result<Message> {
        Ok(delivery.clone())
    }

    fn key<'a>(&self, delivery: &'a Message) -> Option<&'a str> {
        delivery.key()
    }

    fn parent_context(&self, delivery: &Message) -> Context {
        self.shared.propagator.resume(delivery.properties())
    }

    async fn ack(&mut self, _delivery: Message) -> Result<()> {
        Ok(())
    }

    async fn requeue(&mut self, delivery: Message, delay: Duration) -> Result<()> {
        let channel = Arc::clone(&self.channel);
        let shutdown = self.shared.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = channel.send(delivery).await {
                        debug!(topic = %channel.topic, error = %e, "Requeue dropped");
                    }
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests;
