use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use quark_core::{Event, Subject, SubjectPattern, validate_token};

use crate::broker::{Broker, ConsumerConfig, ConsumerInfo, StreamInfo};
use crate::error::{BusError, BusResult};
use crate::subscription::{ConsumerLoop, EventHandler, SubscribeOptions, Subscription, default_durable};

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Namespace prepended to every subject on the wire.
    pub subject_prefix: String,
    pub ack_wait: Duration,
    pub max_deliver: u32,
    pub nak_delay: Option<Duration>,
    /// Pause after a failed fetch before the subscriber loop tries again.
    pub retry_interval: Duration,
    /// How long `disconnect` waits for running handlers.
    pub drain_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subject_prefix: "quark".to_string(),
            ack_wait: Duration::from_secs(30),
            max_deliver: 5,
            nak_delay: None,
            retry_interval: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub connected: bool,
    pub subject_prefix: String,
    pub subscriptions: usize,
    pub published: u64,
}

/// Filters for [`EventBus::event_history`].
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Keep only the most recent `limit` matches.
    pub limit: Option<usize>,
}

/// Topic-addressed publish/subscribe over a [`Broker`].
///
/// Callers use bare subjects such as `service.registered`; the configured
/// prefix is added on the way out and removed on the way in. Every
/// subscription's loop hangs off one root cancellation token, so
/// [`EventBus::disconnect`] stops them all.
pub struct EventBus {
    broker: Arc<dyn Broker>,
    config: BusConfig,
    root: Mutex<CancellationToken>,
    active: Arc<AtomicUsize>,
    published: AtomicU64,
}

impl EventBus {
    pub fn new(broker: Arc<dyn Broker>, config: BusConfig) -> Self {
        Self {
            broker,
            config,
            root: Mutex::new(CancellationToken::new()),
            active: Arc::new(AtomicUsize::new(0)),
            published: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    fn root(&self) -> MutexGuard<'_, CancellationToken> {
        self.root.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn connect(&self) -> BusResult<()> {
        {
            let mut root = self.root();
            if root.is_cancelled() {
                *root = CancellationToken::new();
            }
        }
        self.broker.connect().await?;
        info!(prefix = %self.config.subject_prefix, "event bus connected");
        Ok(())
    }

    /// Stops every subscription, waits up to the drain timeout for running
    /// handlers, then closes the broker.
    pub async fn disconnect(&self) {
        self.root().cancel();

        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        while self.active.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.active.load(Ordering::SeqCst),
                    "subscribers still running after drain timeout"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        self.broker.close().await;
        info!("event bus disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.broker.is_connected()
    }

    fn ensure_connected(&self) -> BusResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BusError::NotConnected)
        }
    }

    /// Publishes `event` on `subject` and returns the stream sequence.
    ///
    /// Events are not deduplicated; publishing the same event twice stores
    /// it twice.
    pub async fn publish(&self, subject: &str, event: &Event) -> BusResult<u64> {
        self.ensure_connected()?;

        let subject = Subject::new(subject)?.prefixed(&self.config.subject_prefix)?;
        let payload = serde_json::to_vec(event)?;
        let sequence = self.broker.publish(&subject, payload).await?;

        self.published.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("quark_bus_events_published_total").increment(1);
        info!(
            %subject,
            event_id = %event.id,
            event_type = %event.kind,
            sequence,
            "event published"
        );
        Ok(sequence)
    }

    /// Binds a durable consumer for `subject` and starts feeding `handler`.
    ///
    /// Setup errors are returned to the caller and never retried here.
    pub async fn subscribe<H>(
        &self,
        subject: &str,
        handler: H,
        options: SubscribeOptions,
    ) -> BusResult<Subscription>
    where
        H: EventHandler,
    {
        self.ensure_connected()?;

        let pattern = SubjectPattern::new(subject)?;
        let filter = pattern.prefixed(&self.config.subject_prefix)?;
        let durable = options
            .durable
            .clone()
            .unwrap_or_else(|| default_durable(subject));

        let mut consumer = ConsumerConfig::new(durable.clone(), filter);
        consumer.deliver_policy = options.deliver_policy;
        consumer.ack_wait = options.ack_wait.unwrap_or(self.config.ack_wait);
        consumer.max_deliver = options.max_deliver.unwrap_or(self.config.max_deliver);
        self.broker.bind_consumer(&consumer).await?;

        let token = self.root().child_token();
        let consumer_loop = ConsumerLoop {
            broker: self.broker.clone(),
            durable: durable.clone(),
            prefix: self.config.subject_prefix.clone(),
            handler: Arc::new(handler),
            nak_delay: options.nak_delay.or(self.config.nak_delay),
            retry_interval: self.config.retry_interval,
            active: self.active.clone(),
        };

        info!(subject, durable = %durable, "subscribed");
        Ok(consumer_loop.spawn(pattern, token))
    }

    /// Every lifecycle event of one module, on durable `module-<id>-consumer`.
    pub async fn subscribe_to_module_events<H>(&self, module_id: &str, handler: H) -> BusResult<Subscription>
    where
        H: EventHandler,
    {
        validate_token(module_id)?;
        self.subscribe(
            &format!("module.{module_id}.>"),
            handler,
            SubscribeOptions::durable(format!("module-{module_id}-consumer")),
        )
        .await
    }

    pub async fn subscribe_to_all_events<H>(&self, handler: H) -> BusResult<Subscription>
    where
        H: EventHandler,
    {
        self.subscribe(">", handler, SubscribeOptions::durable("all-events-consumer"))
            .await
    }

    /// Retained events on subjects matching `pattern`, oldest first.
    pub async fn event_history(&self, pattern: &str, query: &HistoryQuery) -> BusResult<Vec<Event>> {
        self.ensure_connected()?;

        let filter = SubjectPattern::new(pattern)?.prefixed(&self.config.subject_prefix)?;
        let messages = self.broker.history(&filter).await?;

        let mut events: Vec<Event> = messages
            .into_iter()
            .filter_map(|message| match serde_json::from_slice::<Event>(&message.payload) {
                Ok(event) => Some(event),
                Err(err) => {
                    warn!(subject = %message.subject, sequence = message.sequence, error = %err, "skipping undecodable message");
                    None
                }
            })
            .filter(|event| query.start.is_none_or(|start| event.timestamp >= start))
            .filter(|event| query.end.is_none_or(|end| event.timestamp <= end))
            .collect();

        if let Some(limit) = query.limit {
            let skip = events.len().saturating_sub(limit);
            events.drain(..skip);
        }

        debug!(pattern, count = events.len(), "event history read");
        Ok(events)
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            connected: self.is_connected(),
            subject_prefix: self.config.subject_prefix.clone(),
            subscriptions: self.active.load(Ordering::SeqCst),
            published: self.published.load(Ordering::Relaxed),
        }
    }

    pub async fn stream_info(&self) -> BusResult<StreamInfo> {
        self.broker.stream_info().await
    }

    pub async fn consumer_info(&self, durable: &str) -> BusResult<ConsumerInfo> {
        self.broker.consumer_info(durable).await
    }
}
