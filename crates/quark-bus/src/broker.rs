use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use quark_core::{Subject, SubjectPattern};

use crate::error::BusResult;

/// Where a newly created durable consumer starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliverPolicy {
    /// Every message still retained by the stream.
    All,
    /// Only messages published after the consumer was created.
    #[default]
    New,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub durable: String,
    pub filter: SubjectPattern,
    pub deliver_policy: DeliverPolicy,
    /// How long a delivery may stay unacknowledged before it is redelivered.
    pub ack_wait: Duration,
    /// Deliveries beyond this count are dead-lettered instead.
    pub max_deliver: u32,
}

impl ConsumerConfig {
    pub fn new(durable: impl Into<String>, filter: SubjectPattern) -> Self {
        Self {
            durable: durable.into(),
            filter,
            deliver_policy: DeliverPolicy::default(),
            ack_wait: Duration::from_secs(30),
            max_deliver: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub name: String,
    pub max_messages: usize,
    pub max_age: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: "QUARK_EVENTS".to_string(),
            max_messages: 10_000,
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// One delivery of a stored message to a durable consumer.
#[derive(Debug, Clone)]
pub struct Message {
    pub subject: Subject,
    pub sequence: u64,
    pub payload: Vec<u8>,
    pub published_at: DateTime<Utc>,
    /// 1 on first delivery; 0 for messages read through history.
    pub delivery_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub durable: String,
    pub filter: String,
    pub pending: usize,
    pub in_flight: usize,
    pub delivered: u64,
    pub acked: u64,
    pub naked: u64,
    pub redelivered: u64,
    pub dead_lettered: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub name: String,
    pub messages: usize,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub consumers: usize,
}

/// A persistent stream with durable, acknowledging consumers.
///
/// Consumers bound to the same durable name share one delivery position, so
/// concurrent readers load-balance. Distinct durable names each see every
/// matching message. Delivery is at-least-once.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> BusResult<()>;
    async fn close(&self);
    fn is_connected(&self) -> bool;

    /// Appends to the stream and returns the assigned sequence.
    async fn publish(&self, subject: &Subject, payload: Vec<u8>) -> BusResult<u64>;

    /// Creates the durable consumer, or attaches to it if it already exists
    /// with the same filter.
    async fn bind_consumer(&self, config: &ConsumerConfig) -> BusResult<ConsumerInfo>;

    /// Waits for the next message owed to `durable`.
    async fn next_message(&self, durable: &str) -> BusResult<Message>;

    async fn ack(&self, durable: &str, sequence: u64) -> BusResult<()>;

    /// Returns the message for redelivery, after `delay` if given.
    async fn nak(&self, durable: &str, sequence: u64, delay: Option<Duration>) -> BusResult<()>;

    async fn consumer_info(&self, durable: &str) -> BusResult<ConsumerInfo>;

    async fn stream_info(&self) -> BusResult<StreamInfo>;

    /// Retained messages matching `filter`, oldest first.
    async fn history(&self, filter: &SubjectPattern) -> BusResult<Vec<Message>>;
}
