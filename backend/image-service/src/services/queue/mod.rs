//! Durable job queue between the upload API and the workers.
//!
//! - **JobQueue**: publish / fetch / ack / nack over a single routing key
//! - **RedisStreamQueue**: Redis Streams with a consumer group; unacked entries
//!   stay in the group's pending list and are redelivered after a restart
//! - **InMemoryQueue**: process-local queue for tests and embedded workers
//! - **Consumer**: prefetch-bounded loop that settles every delivery
//!
//! Delivery is at-least-once. A message is removed only by an explicit ack,
//! or by a nack, which either puts it back (`requeue`) or moves it to the
//! dead-letter stream `<routing_key>:dead`.

use async_trait::async_trait;
use thiserror::Error;

pub mod consumer;
pub mod memory;
pub mod redis_stream;

pub use self::consumer::{Consumer, ConsumerStats, DeliveryHandler, Settlement};
pub use self::memory::InMemoryQueue;
pub use self::redis_stream::{RedisQueueConfig, RedisStreamQueue};

pub const DEAD_LETTER_SUFFIX: &str = ":dead";

pub fn dead_letter_key(routing_key: &str) -> String {
    format!("{routing_key}{DEAD_LETTER_SUFFIX}")
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue connection is closed")]
    NotConnected,

    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("failed to publish message: {0}")]
    Publish(String),

    #[error("no queue bound to routing key {0}")]
    Unroutable(String),

    #[error("unknown delivery {0}")]
    UnknownDelivery(String),

    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// A fetched, not yet settled message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned id, used to settle the message
    pub id: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    /// 1 on first delivery, incremented on every requeue
    pub attempt: u32,
    /// Delivered before, but never settled (e.g. worker crash)
    pub redelivered: bool,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Publish a persistent message. Returns the broker message id.
    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<String, QueueError>;

    /// Up to `max` deliveries. Waits a bounded time for work and may return
    /// an empty batch, so callers can check for shutdown between calls.
    async fn fetch(&self, max: usize) -> Result<Vec<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Reject a delivery: back onto the queue when `requeue`, otherwise to
    /// the dead-letter stream.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;

    /// Drop broker connections. Later publishes fail.
    async fn disconnect(&self);
}
