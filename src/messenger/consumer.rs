//! Receive-loop engine shared by every backend.
//!
//! A backend supplies a [`Receiver`] (receive, decode, ack, requeue); the
//! engine owns the per-message state machine:
//!
//! 1. receive the next delivery (cancellable)
//! 2. decode it; undecodable deliveries are logged and acked
//! 3. resume the trace context and run the handler inside a consumer span
//! 4. ack on success, apply the [`FailurePolicy`] on failure
//! 5. exit quietly on cancellation
//!
//! Each loop processes strictly sequentially. Fan-out is achieved by running
//! several loops, each with its own receiver.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBackoff};
use futures::future::BoxFuture;
use opentelemetry::trace::FutureExt as _;
use opentelemetry::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use super::{Backend, HandlerResult, Message, MessengerError, Result};
use crate::utils::metrics::{backend_attr, outcome_attr, topic_attr, CONSUME_TOTAL};
use crate::utils::retry::receive_backoff;

// ============================================================================
// Policy & state
// ============================================================================

/// What happens to a message whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log, then ack/commit/checkpoint anyway. The message is not redelivered.
    SuppressAndAck,
    /// Log, then make the message visible again after the delay.
    RequeueWithDelay(Duration),
}

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Constructed, loops not yet started.
    Idle,
    /// At least one receive loop is active.
    Running,
    /// Cancellation requested, loops unwinding.
    Cancelling,
    /// Every loop exited and released its backend resources.
    Stopped,
}

// ============================================================================
// Handler
// ============================================================================

/// Callback invoked for each received item.
///
/// The token is cancelled when the subscription stops; long-running handlers
/// should observe it. Returning `MessengerError::Cancelled` (boxed) is treated
/// as a clean stop rather than a failure.
pub trait MessageHandler<T = Message>: Send + Sync {
    fn handle(&self, item: T, token: CancellationToken) -> BoxFuture<'static, HandlerResult>;
}

impl<T, F, Fut> MessageHandler<T> for F
where
    F: Fn(T, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, item: T, token: CancellationToken) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(item, token))
    }
}

/// Wrap a closure as a shareable message handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(f)
}

// ============================================================================
// Receiver
// ============================================================================

/// Backend side of a receive loop.
#[async_trait]
pub trait Receiver: Send + 'static {
    /// Raw delivery as handed out by the backend client.
    type Delivery: Send + Sync + 'static;
    /// Decoded value passed to the handler.
    type Item: Send + 'static;

    /// Wait for the next delivery.
    ///
    /// `Ok(None)` is an empty poll and the loop simply asks again.
    /// `Err(MessengerError::Closed)` ends the loop.
    async fn receive(&mut self) -> Result<Option<Self::Delivery>>;

    fn decode(&self, delivery: &Self::Delivery) -> Result<Self::Item>;

    /// Partition/ordering key, recorded on the consumer span.
    fn key<'a>(&self, delivery: &'a Self::Delivery) -> Option<&'a str>;

    /// Propagation context carried by the delivery.
    fn parent_context(&self, delivery: &Self::Delivery) -> Context;

    /// Commit, checkpoint or delete the delivery.
    async fn ack(&mut self, delivery: Self::Delivery) -> Result<()>;

    /// Make the delivery available again after `delay`.
    async fn requeue(&mut self, delivery: Self::Delivery, _delay: Duration) -> Result<()> {
        self.ack(delivery).await
    }

    /// Release backend resources. Called once when the loop exits.
    async fn close(&mut self) {}
}

// ============================================================================
// Subscription
// ============================================================================

/// Handle to the receive loops started by one `subscribe` call.
///
/// Dropping the handle cancels the loops without waiting; call
/// [`Subscription::shutdown`] to cancel and wait for them to unwind.
pub struct Subscription {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    state: watch::Receiver<SubscriptionState>,
    lifecycle: Arc<Lifecycle>,
}

impl Subscription {
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Token observed by the loops and passed to the handler.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Request cancellation without waiting.
    pub fn cancel(&self) {
        self.token.cancel();
        self.lifecycle.cancelling();
    }

    /// Cancel and wait until every loop has exited.
    pub async fn shutdown(mut self) {
        self.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(error = %e, "Receive loop panicked");
                }
            }
        }
    }

    /// Wait until the loops stop on their own (parent cancellation or a closed backend).
    pub async fn stopped(&self) {
        let mut state = self.state.clone();
        let _ = state
            .wait_for(|s| *s == SubscriptionState::Stopped)
            .await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("state", &self.state())
            .field("loops", &self.tasks.len())
            .finish()
    }
}

struct Lifecycle {
    state: watch::Sender<SubscriptionState>,
    live: AtomicUsize,
}

impl Lifecycle {
    fn cancelling(&self) {
        self.state.send_if_modified(|s| {
            if *s == SubscriptionState::Running {
                *s = SubscriptionState::Cancelling;
                true
            } else {
                false
            }
        });
    }

    fn loop_exited(&self) {
        if self.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state.send_replace(SubscriptionState::Stopped);
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Per-subscription settings shared by its loops.
pub struct LoopConfig<T> {
    pub backend: Backend,
    pub topic: String,
    pub policy: FailurePolicy,
    pub handler: Arc<dyn MessageHandler<T>>,
}

/// Start one receive loop per receiver under a child of `parent`.
pub fn spawn_loops<R>(
    config: LoopConfig<R::Item>,
    receivers: Vec<R>,
    parent: &CancellationToken,
) -> Subscription
where
    R: Receiver,
{
    let token = parent.child_token();
    let (state_tx, state_rx) = watch::channel(SubscriptionState::Idle);
    let lifecycle = Arc::new(Lifecycle {
        state: state_tx,
        live: AtomicUsize::new(receivers.len()),
    });
    let config = Arc::new(config);

    if receivers.is_empty() {
        lifecycle.state.send_replace(SubscriptionState::Stopped);
    } else {
        lifecycle.state.send_replace(SubscriptionState::Running);
    }

    let tasks = receivers
        .into_iter()
        .map(|receiver| {
            tokio::spawn(run_loop(
                receiver,
                Arc::clone(&config),
                Arc::clone(&lifecycle),
                token.clone(),
            ))
        })
        .collect();

    debug!(
        backend = %config.backend,
        topic = %config.topic,
        "Subscription started"
    );

    Subscription {
        token,
        tasks,
        state: state_rx,
        lifecycle,
    }
}

async fn run_loop<R: Receiver>(
    mut receiver: R,
    config: Arc<LoopConfig<R::Item>>,
    lifecycle: Arc<Lifecycle>,
    token: CancellationToken,
) {
    let mut backoff: Option<ExponentialBackoff> = None;

    loop {
        let received = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            received = receiver.receive() => received,
        };

        let delivery = match received {
            Ok(Some(delivery)) => {
                backoff = None;
                delivery
            }
            Ok(None) => continue,
            Err(MessengerError::Closed) => {
                debug!(topic = %config.topic, "Backend closed, stopping receive loop");
                break;
            }
            Err(MessengerError::Cancelled) => break,
            Err(e) => {
                error!(topic = %config.topic, error = %e, "Receive failed");
                let delay = backoff
                    .get_or_insert_with(|| receive_backoff().build())
                    .next()
                    .unwrap_or(Duration::from_secs(1));
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        if !process(&mut receiver, &config, &token, delivery).await {
            break;
        }
    }

    if token.is_cancelled() {
        lifecycle.cancelling();
    }
    receiver.close().await;
    debug!(topic = %config.topic, "Receive loop stopped");
    lifecycle.loop_exited();
}

/// Process one delivery. Returns false when the loop should stop.
async fn process<R: Receiver>(
    receiver: &mut R,
    config: &LoopConfig<R::Item>,
    token: &CancellationToken,
    delivery: R::Delivery,
) -> bool {
    let item = match receiver.decode(&delivery) {
        Ok(item) => item,
        Err(e) => {
            error!(topic = %config.topic, error = %e, "Dropping undecodable message");
            record_consume(config, "poison");
            if let Err(e) = receiver.ack(delivery).await {
                error!(topic = %config.topic, error = %e, "Failed to ack undecodable message");
            }
            return true;
        }
    };

    let span = tracing::info_span!(
        "messenger.receive",
        messaging.system = config.backend.as_str(),
        messaging.destination = %config.topic,
        message.key = tracing::field::Empty,
        otel.kind = "consumer",
        otel.status_code = tracing::field::Empty,
    );
    if let Some(key) = receiver.key(&delivery) {
        span.record("message.key", key);
    }
    let parent = receiver.parent_context(&delivery);
    span.set_parent(parent.clone());

    let outcome = config
        .handler
        .handle(item, token.clone())
        .with_context(parent)
        .instrument(span.clone())
        .await;

    match outcome {
        Ok(()) => {
            record_consume(config, "ok");
            if let Err(e) = receiver.ack(delivery).await {
                error!(parent: &span, topic = %config.topic, error = %e, "Failed to ack message");
            }
            true
        }
        Err(e) if token.is_cancelled() || MessengerError::is_cancellation(&e) => {
            debug!(parent: &span, topic = %config.topic, "Handler cancelled");
            false
        }
        Err(e) => {
            span.record("otel.status_code", "ERROR");
            warn!(parent: &span, topic = %config.topic, error = %e, "Message handler failed");
            record_consume(config, "error");
            let settled = match config.policy {
                FailurePolicy::SuppressAndAck => receiver.ack(delivery).await,
                FailurePolicy::RequeueWithDelay(delay) => receiver.requeue(delivery, delay).await,
            };
            if let Err(e) = settled {
                error!(parent: &span, topic = %config.topic, error = %e, "Failed to settle failed message");
            }
            true
        }
    }
}

fn record_consume<T>(config: &LoopConfig<T>, outcome: &str) {
    CONSUME_TOTAL.add(
        1,
        &[
            backend_attr(config.backend.as_str()),
            topic_attr(&config.topic),
            outcome_attr(outcome),
        ],
    );
}
