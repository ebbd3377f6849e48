//! In-process broker with JetStream-style durable consumers. Messages past
//! `max_deliver` are dropped from their consumer and counted as dead-lettered.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use quark_core::time::to_chrono;
use quark_core::{Subject, SubjectPattern};

use crate::broker::{Broker, ConsumerConfig, ConsumerInfo, DeliverPolicy, Message, StreamConfig, StreamInfo};
use crate::error::{BusError, BusResult};

/// Upper bound on how long a waiting reader sleeps before re-checking
/// expired deliveries.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

struct Stored {
    subject: Subject,
    sequence: u64,
    payload: Vec<u8>,
    published_at: DateTime<Utc>,
}

impl Stored {
    fn to_message(&self, delivery_count: u32) -> Message {
        Message {
            subject: self.subject.clone(),
            sequence: self.sequence,
            payload: self.payload.clone(),
            published_at: self.published_at,
            delivery_count,
        }
    }
}

struct ConsumerState {
    config: ConsumerConfig,
    pending: VecDeque<u64>,
    /// Sequence -> instant at which the delivery is handed out again.
    in_flight: HashMap<u64, Instant>,
    deliveries: HashMap<u64, u32>,
    info: ConsumerInfo,
    notify: Arc<Notify>,
}

impl ConsumerState {
    fn new(config: ConsumerConfig) -> Self {
        let info = ConsumerInfo {
            durable: config.durable.clone(),
            filter: config.filter.to_string(),
            ..Default::default()
        };
        Self {
            config,
            pending: VecDeque::new(),
            in_flight: HashMap::new(),
            deliveries: HashMap::new(),
            info,
            notify: Arc::new(Notify::new()),
        }
    }

    fn reclaim_expired(&mut self, now: Instant) {
        let mut expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, due)| **due <= now)
            .map(|(seq, _)| *seq)
            .collect();
        if expired.is_empty() {
            return;
        }
        expired.sort_unstable();
        for seq in expired.iter().rev() {
            self.in_flight.remove(seq);
            self.pending.push_front(*seq);
        }
    }

    fn forget_before(&mut self, first: u64) {
        self.pending.retain(|seq| *seq >= first);
        self.in_flight.retain(|seq, _| *seq >= first);
        self.deliveries.retain(|seq, _| *seq >= first);
    }

    fn snapshot(&self) -> ConsumerInfo {
        ConsumerInfo {
            pending: self.pending.len(),
            in_flight: self.in_flight.len(),
            ..self.info.clone()
        }
    }
}

struct State {
    stream: VecDeque<Stored>,
    last_sequence: u64,
    consumers: HashMap<String, ConsumerState>,
}

impl State {
    fn evict(&mut self, config: &StreamConfig, now: DateTime<Utc>) {
        let oldest_allowed = now - to_chrono(config.max_age);
        while let Some(front) = self.stream.front() {
            if self.stream.len() > config.max_messages || front.published_at < oldest_allowed {
                self.stream.pop_front();
            } else {
                break;
            }
        }

        // Consumers must not keep references to messages the stream dropped.
        let first = self.stream.front().map_or(self.last_sequence + 1, |m| m.sequence);
        for consumer in self.consumers.values_mut() {
            consumer.forget_before(first);
        }
    }
}

pub struct MemoryBroker {
    config: StreamConfig,
    connected: AtomicBool,
    state: Mutex<State>,
}

impl MemoryBroker {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            connected: AtomicBool::new(false),
            state: Mutex::new(State {
                stream: VecDeque::new(),
                last_sequence: 0,
                consumers: HashMap::new(),
            }),
        }
    }

    /// A broker that is already connected.
    pub fn connected(config: StreamConfig) -> Self {
        let broker = Self::new(config);
        broker.connected.store(true, Ordering::SeqCst);
        broker
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_connected(&self) -> BusResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BusError::NotConnected)
        }
    }

    /// Takes the next deliverable message, or returns the consumer's notifier
    /// to wait on.
    fn try_next(&self, durable: &str) -> BusResult<Result<Message, Arc<Notify>>> {
        let mut state = self.lock();
        let now = Instant::now();
        let State { stream, consumers, .. } = &mut *state;
        let consumer = consumers
            .get_mut(durable)
            .ok_or_else(|| BusError::ConsumerNotFound(durable.to_string()))?;

        consumer.reclaim_expired(now);

        while let Some(seq) = consumer.pending.pop_front() {
            let Some(stored) = find_in(stream, seq) else {
                consumer.deliveries.remove(&seq);
                continue;
            };

            let count = consumer.deliveries.entry(seq).or_insert(0);
            *count += 1;
            let count = *count;

            if count > consumer.config.max_deliver {
                consumer.deliveries.remove(&seq);
                consumer.info.dead_lettered += 1;
                warn!(
                    durable,
                    sequence = seq,
                    subject = %stored.subject,
                    "message exceeded max deliveries, dead-lettered"
                );
                continue;
            }

            consumer.in_flight.insert(seq, now + consumer.config.ack_wait);
            consumer.info.delivered += 1;
            if count > 1 {
                consumer.info.redelivered += 1;
            }
            return Ok(Ok(stored.to_message(count)));
        }

        Ok(Err(consumer.notify.clone()))
    }
}

fn find_in(stream: &VecDeque<Stored>, sequence: u64) -> Option<&Stored> {
    let first = stream.front()?.sequence;
    let index = sequence.checked_sub(first)?;
    stream.get(index as usize)
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(StreamConfig::default())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> BusResult<()> {
        if !self.connected.swap(true, Ordering::SeqCst) {
            info!(stream = %self.config.name, "memory broker connected");
        }
        Ok(())
    }

    async fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let state = self.lock();
            for consumer in state.consumers.values() {
                consumer.notify.notify_waiters();
            }
            info!(stream = %self.config.name, "memory broker closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, subject: &Subject, payload: Vec<u8>) -> BusResult<u64> {
        self.ensure_connected()?;

        let now = Utc::now();
        let mut state = self.lock();
        state.last_sequence += 1;
        let sequence = state.last_sequence;
        state.stream.push_back(Stored {
            subject: subject.clone(),
            sequence,
            payload,
            published_at: now,
        });
        state.evict(&self.config, now);

        for consumer in state.consumers.values_mut() {
            if consumer.config.filter.matches(subject) {
                consumer.pending.push_back(sequence);
                consumer.notify.notify_one();
            }
        }

        debug!(%subject, sequence, "message stored");
        Ok(sequence)
    }

    async fn bind_consumer(&self, config: &ConsumerConfig) -> BusResult<ConsumerInfo> {
        self.ensure_connected()?;

        if config.durable.trim().is_empty() || config.durable.chars().any(|c| c.is_whitespace()) {
            return Err(BusError::InvalidDurable(config.durable.clone()));
        }

        let mut state = self.lock();
        if let Some(existing) = state.consumers.get(&config.durable) {
            if existing.config.filter != config.filter {
                return Err(BusError::ConsumerConflict {
                    durable: config.durable.clone(),
                    existing: existing.config.filter.to_string(),
                    requested: config.filter.to_string(),
                });
            }
            debug!(durable = %config.durable, "attached to existing durable consumer");
            return Ok(existing.snapshot());
        }

        let mut consumer = ConsumerState::new(config.clone());
        if config.deliver_policy == DeliverPolicy::All {
            consumer.pending = state
                .stream
                .iter()
                .filter(|m| config.filter.matches(&m.subject))
                .map(|m| m.sequence)
                .collect();
        }
        let info = consumer.snapshot();
        state.consumers.insert(config.durable.clone(), consumer);

        info!(durable = %config.durable, filter = %config.filter, "durable consumer created");
        Ok(info)
    }

    async fn next_message(&self, durable: &str) -> BusResult<Message> {
        loop {
            self.ensure_connected()?;
            let notify = match self.try_next(durable)? {
                Ok(message) => return Ok(message),
                Err(notify) => notify,
            };
            let _ = tokio::time::timeout(POLL_INTERVAL, notify.notified()).await;
        }
    }

    async fn ack(&self, durable: &str, sequence: u64) -> BusResult<()> {
        let mut state = self.lock();
        let consumer = state
            .consumers
            .get_mut(durable)
            .ok_or_else(|| BusError::ConsumerNotFound(durable.to_string()))?;

        let was_in_flight = consumer.in_flight.remove(&sequence).is_some();
        let was_pending = match consumer.pending.iter().position(|s| *s == sequence) {
            Some(index) => {
                consumer.pending.remove(index);
                true
            }
            None => false,
        };
        if was_in_flight || was_pending {
            consumer.deliveries.remove(&sequence);
            consumer.info.acked += 1;
        }
        Ok(())
    }

    async fn nak(&self, durable: &str, sequence: u64, delay: Option<Duration>) -> BusResult<()> {
        let mut state = self.lock();
        let consumer = state
            .consumers
            .get_mut(durable)
            .ok_or_else(|| BusError::ConsumerNotFound(durable.to_string()))?;

        if consumer.in_flight.remove(&sequence).is_none() {
            return Ok(());
        }
        consumer.info.naked += 1;

        match delay.filter(|d| !d.is_zero()) {
            Some(delay) => {
                consumer.in_flight.insert(sequence, Instant::now() + delay);
            }
            None => {
                consumer.pending.push_front(sequence);
                consumer.notify.notify_one();
            }
        }
        Ok(())
    }

    async fn consumer_info(&self, durable: &str) -> BusResult<ConsumerInfo> {
        let state = self.lock();
        state
            .consumers
            .get(durable)
            .map(ConsumerState::snapshot)
            .ok_or_else(|| BusError::ConsumerNotFound(durable.to_string()))
    }

    async fn stream_info(&self) -> BusResult<StreamInfo> {
        let state = self.lock();
        Ok(StreamInfo {
            name: self.config.name.clone(),
            messages: state.stream.len(),
            first_sequence: state.stream.front().map(|m| m.sequence).unwrap_or(0),
            last_sequence: state.last_sequence,
            consumers: state.consumers.len(),
        })
    }

    async fn history(&self, filter: &SubjectPattern) -> BusResult<Vec<Message>> {
        let state = self.lock();
        Ok(state
            .stream
            .iter()
            .filter(|m| filter.matches(&m.subject))
            .map(|m| m.to_message(0))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(s: &str) -> Subject {
        Subject::new(s).unwrap()
    }

    fn consumer(durable: &str, filter: &str) -> ConsumerConfig {
        ConsumerConfig::new(durable, SubjectPattern::new(filter).unwrap())
    }

    #[tokio::test]
    async fn publish_requires_connection() {
        let broker = MemoryBroker::default();
        let err = broker.publish(&subject("a.b"), vec![]).await.unwrap_err();
        assert!(matches!(err, BusError::NotConnected));
    }

    #[tokio::test]
    async fn distinct_durables_fan_out() {
        let broker = MemoryBroker::connected(StreamConfig::default());
        broker.bind_consumer(&consumer("one", "service.>")).await.unwrap();
        broker.bind_consumer(&consumer("two", "service.>")).await.unwrap();

        broker.publish(&subject("service.registered"), b"x".to_vec()).await.unwrap();

        let a = broker.next_message("one").await.unwrap();
        let b = broker.next_message("two").await.unwrap();
        assert_eq!(a.sequence, b.sequence);
        assert_eq!(a.delivery_count, 1);
    }

    #[tokio::test]
    async fn shared_durable_delivers_once() {
        let broker = MemoryBroker::connected(StreamConfig::default());
        broker.bind_consumer(&consumer("workers", "jobs.*")).await.unwrap();
        broker.bind_consumer(&consumer("workers", "jobs.*")).await.unwrap();

        broker.publish(&subject("jobs.a"), vec![]).await.unwrap();
        broker.publish(&subject("jobs.b"), vec![]).await.unwrap();

        let first = broker.next_message("workers").await.unwrap();
        let second = broker.next_message("workers").await.unwrap();
        assert_ne!(first.sequence, second.sequence);

        let info = broker.consumer_info("workers").await.unwrap();
        assert_eq!(info.pending, 0);
        assert_eq!(info.in_flight, 2);
    }

    #[tokio::test]
    async fn rebinding_with_other_filter_conflicts() {
        let broker = MemoryBroker::connected(StreamConfig::default());
        broker.bind_consumer(&consumer("c", "a.>")).await.unwrap();
        let err = broker.bind_consumer(&consumer("c", "b.>")).await.unwrap_err();
        assert!(matches!(err, BusError::ConsumerConflict { .. }));
    }

    #[tokio::test]
    async fn nak_redelivers_and_ack_settles() {
        let broker = MemoryBroker::connected(StreamConfig::default());
        broker.bind_consumer(&consumer("c", ">")).await.unwrap();
        broker.publish(&subject("x.y"), vec![1]).await.unwrap();

        let first = broker.next_message("c").await.unwrap();
        broker.nak("c", first.sequence, None).await.unwrap();

        let again = broker.next_message("c").await.unwrap();
        assert_eq!(again.sequence, first.sequence);
        assert_eq!(again.delivery_count, 2);

        broker.ack("c", again.sequence).await.unwrap();
        let info = broker.consumer_info("c").await.unwrap();
        assert_eq!(info.acked, 1);
        assert_eq!(info.naked, 1);
        assert_eq!(info.redelivered, 1);
        assert_eq!(info.in_flight, 0);
    }

    #[tokio::test]
    async fn unacked_delivery_returns_after_ack_wait() {
        let broker = MemoryBroker::connected(StreamConfig::default());
        let mut config = consumer("c", ">");
        config.ack_wait = Duration::from_millis(20);
        broker.bind_consumer(&config).await.unwrap();
        broker.publish(&subject("x.y"), vec![]).await.unwrap();

        let first = broker.next_message("c").await.unwrap();
        let again = tokio::time::timeout(Duration::from_secs(2), broker.next_message("c"))
            .await
            .expect("redelivery after ack wait")
            .unwrap();
        assert_eq!(again.sequence, first.sequence);
        assert_eq!(again.delivery_count, 2);
    }

    #[tokio::test]
    async fn exceeding_max_deliver_dead_letters() {
        let broker = MemoryBroker::connected(StreamConfig::default());
        let mut config = consumer("c", ">");
        config.max_deliver = 2;
        broker.bind_consumer(&config).await.unwrap();
        broker.publish(&subject("x.y"), vec![]).await.unwrap();

        for _ in 0..2 {
            let m = broker.next_message("c").await.unwrap();
            broker.nak("c", m.sequence, None).await.unwrap();
        }

        let waited = tokio::time::timeout(Duration::from_millis(150), broker.next_message("c")).await;
        assert!(waited.is_err());
        assert_eq!(broker.consumer_info("c").await.unwrap().dead_lettered, 1);
    }

    #[tokio::test]
    async fn deliver_all_replays_retained_messages() {
        let broker = MemoryBroker::connected(StreamConfig::default());
        broker.publish(&subject("service.registered"), vec![]).await.unwrap();
        broker.publish(&subject("module.registered"), vec![]).await.unwrap();

        let mut config = consumer("late", "service.>");
        config.deliver_policy = DeliverPolicy::All;
        let info = broker.bind_consumer(&config).await.unwrap();
        assert_eq!(info.pending, 1);

        let mut config = consumer("new-only", "service.>");
        config.deliver_policy = DeliverPolicy::New;
        assert_eq!(broker.bind_consumer(&config).await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn retention_bounds_stream_and_history() {
        let broker = MemoryBroker::connected(StreamConfig {
            max_messages: 3,
            ..Default::default()
        });
        for i in 0..5 {
            broker.publish(&subject(&format!("e.n{i}")), vec![]).await.unwrap();
        }

        let info = broker.stream_info().await.unwrap();
        assert_eq!(info.messages, 3);
        assert_eq!(info.first_sequence, 3);
        assert_eq!(info.last_sequence, 5);

        let history = broker.history(&SubjectPattern::new("e.*").unwrap()).await.unwrap();
        let seqs: Vec<u64> = history.iter().map(|m| m.sequence).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn idle_consumer_queue_follows_retention() {
        let broker = MemoryBroker::connected(StreamConfig {
            max_messages: 3,
            ..Default::default()
        });
        broker.bind_consumer(&consumer("idle", "e.>")).await.unwrap();
        broker.bind_consumer(&consumer("busy", "e.>")).await.unwrap();

        broker.publish(&subject("e.n0"), vec![]).await.unwrap();
        let taken = broker.next_message("busy").await.unwrap();
        assert_eq!(taken.sequence, 1);
        for i in 1..50 {
            broker.publish(&subject(&format!("e.n{i}")), vec![]).await.unwrap();
        }

        let idle = broker.consumer_info("idle").await.unwrap();
        assert_eq!(idle.pending, 3);
        let busy = broker.consumer_info("busy").await.unwrap();
        assert_eq!(busy.in_flight, 0);
        assert_eq!(busy.pending, 3);

        let next = broker.next_message("idle").await.unwrap();
        assert_eq!(next.sequence, 48);
    }

    #[tokio::test]
    async fn close_wakes_waiting_readers() {
        let broker = Arc::new(MemoryBroker::connected(StreamConfig::default()));
        broker.bind_consumer(&consumer("c", ">")).await.unwrap();

        let reader = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.next_message("c").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert!(matches!(result, Err(BusError::NotConnected)));
    }
}
