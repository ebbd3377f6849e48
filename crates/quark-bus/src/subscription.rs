use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use quark_core::{Event, SubjectPattern};

use crate::broker::{Broker, DeliverPolicy, Message};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives events from a durable consumer.
///
/// Returning `Ok` acknowledges the message; `Err` (or a panic) negatively
/// acknowledges it and it will be delivered again. Delivery is at-least-once,
/// so handlers must be idempotent.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: Event) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        (self)(event).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Durable consumer name. Derived from the subject when absent.
    pub durable: Option<String>,
    pub deliver_policy: DeliverPolicy,
    pub ack_wait: Option<Duration>,
    pub max_deliver: Option<u32>,
    /// Delay before a nak'd message is redelivered. Immediate when absent.
    pub nak_delay: Option<Duration>,
}

impl SubscribeOptions {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            durable: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn deliver_all(mut self) -> Self {
        self.deliver_policy = DeliverPolicy::All;
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = Some(ack_wait);
        self
    }

    pub fn with_max_deliver(mut self, max_deliver: u32) -> Self {
        self.max_deliver = Some(max_deliver);
        self
    }

    pub fn with_nak_delay(mut self, delay: Duration) -> Self {
        self.nak_delay = Some(delay);
        self
    }
}

/// `service.>` becomes `service-all-consumer`.
pub(crate) fn default_durable(subject: &str) -> String {
    let name: String = subject
        .split('.')
        .map(|token| match token {
            "*" => "any",
            ">" => "all",
            other => other,
        })
        .collect::<Vec<_>>()
        .join("-");
    format!("{name}-consumer")
}

#[derive(Debug, Default)]
pub struct SubscriptionStats {
    pub received: AtomicU64,
    pub acked: AtomicU64,
    pub naked: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub received: u64,
    pub acked: u64,
    pub naked: u64,
}

/// A running consumer loop. Dropping it cancels the loop.
pub struct Subscription {
    pattern: SubjectPattern,
    durable: String,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
    stats: Arc<SubscriptionStats>,
}

impl Subscription {
    pub fn subject(&self) -> &SubjectPattern {
        &self.pattern
    }

    pub fn durable(&self) -> &str {
        &self.durable
    }

    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stats(&self) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            received: self.stats.received.load(Ordering::Relaxed),
            acked: self.stats.acked.load(Ordering::Relaxed),
            naked: self.stats.naked.load(Ordering::Relaxed),
        }
    }

    /// Stops consuming and waits up to `drain` for an in-flight handler.
    ///
    /// Returns `false` if the handler had to be abandoned; its message stays
    /// unacknowledged and is redelivered once the consumer's ack wait elapses.
    pub async fn shutdown(mut self, drain: Duration) -> bool {
        self.token.cancel();
        let Some(mut handle) = self.handle.take() else {
            return true;
        };

        match tokio::time::timeout(drain, &mut handle).await {
            Ok(_) => true,
            Err(_) => {
                warn!(durable = %self.durable, ?drain, "handler did not finish within drain timeout, abandoning");
                handle.abort();
                false
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Counts a consumer loop as live until its task ends or is aborted.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(active)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct ConsumerLoop {
    pub broker: Arc<dyn Broker>,
    pub durable: String,
    pub prefix: String,
    pub handler: Arc<dyn EventHandler>,
    pub nak_delay: Option<Duration>,
    pub retry_interval: Duration,
    pub active: Arc<AtomicUsize>,
}

impl ConsumerLoop {
    pub(crate) fn spawn(self, pattern: SubjectPattern, token: CancellationToken) -> Subscription {
        let stats = Arc::new(SubscriptionStats::default());
        let durable = self.durable.clone();

        let guard = ActiveGuard::new(self.active.clone());
        let run = self.run(token.clone(), stats.clone());
        let handle = tokio::spawn(async move {
            let _guard = guard;
            run.await;
        });

        Subscription {
            pattern,
            durable,
            token,
            handle: Some(handle),
            stats,
        }
    }

    async fn run(self, token: CancellationToken, stats: Arc<SubscriptionStats>) {
        info!(durable = %self.durable, "subscriber loop started");

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = self.broker.next_message(&self.durable) => next,
            };

            match next {
                Ok(message) => self.process(message, &stats).await,
                Err(err) => {
                    warn!(durable = %self.durable, error = %err, "fetch failed, retrying");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.retry_interval) => {}
                    }
                }
            }
        }

        info!(durable = %self.durable, "subscriber loop stopped");
    }

    async fn process(&self, message: Message, stats: &SubscriptionStats) {
        stats.received.fetch_add(1, Ordering::Relaxed);
        let sequence = message.sequence;
        let subject = message.subject.strip_prefix(&self.prefix);

        let outcome = match serde_json::from_slice::<Event>(&message.payload) {
            Ok(event) => match AssertUnwindSafe(self.handler.handle(event)).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err("handler panicked".into()),
            },
            Err(err) => Err(Box::new(err) as HandlerError),
        };

        match outcome {
            Ok(()) => {
                if let Err(err) = self.broker.ack(&self.durable, sequence).await {
                    warn!(durable = %self.durable, sequence, error = %err, "ack failed");
                    return;
                }
                stats.acked.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("quark_bus_messages_total", "outcome" => "ack").increment(1);
                debug!(durable = %self.durable, %subject, sequence, "message acknowledged");
            }
            Err(err) => {
                warn!(
                    durable = %self.durable,
                    %subject,
                    sequence,
                    delivery = message.delivery_count,
                    error = %err,
                    "event handler failed, message nak'd"
                );
                if let Err(err) = self.broker.nak(&self.durable, sequence, self.nak_delay).await {
                    warn!(durable = %self.durable, sequence, error = %err, "nak failed");
                    return;
                }
                stats.naked.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("quark_bus_messages_total", "outcome" => "nak").increment(1);
            }
        }
    }
}
