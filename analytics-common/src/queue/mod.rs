use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryQueue;
pub use self::redis::RedisQueue;

pub const DEFAULT_QUEUE_KEY: &str = "analytics:events";

/// Enumeration of errors for operations on an `EventQueue`.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("connection failed with: {0}")]
    ConnectionError(::redis::RedisError),
    #[error("{command} command failed with: {error}")]
    CommandError {
        command: &'static str,
        error: ::redis::RedisError,
    },
    #[error("queue is closed")]
    Closed,
    #[error("queue handle was opened for appending only")]
    ProducerOnly,
}

/// An item taken from the queue that has been neither acknowledged nor returned yet.
/// Until one of those happens it sits in the consumer's in-flight list, where `recover`
/// can find it again after a crash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub payload: Vec<u8>,
    receipt: u64,
}

impl Delivery {
    pub(crate) fn new(payload: Vec<u8>, receipt: u64) -> Self {
        Self { payload, receipt }
    }

    pub(crate) fn receipt(&self) -> u64 {
        self.receipt
    }
}

/// A FIFO queue of opaque payloads with take-then-acknowledge consumption.
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Append a payload at the tail.
    async fn append(&self, payload: Vec<u8>) -> Result<(), QueueError>;

    /// Wait for the head item and move it to the in-flight list. `None` waits forever;
    /// returns `Ok(None)` if the timeout elapsed with the queue still empty.
    async fn take(&self, timeout: Option<Duration>) -> Result<Option<Delivery>, QueueError>;

    /// The delivery was handled (stored or deliberately dropped): forget it.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// The delivery could not be handled: put it back at the head so it is taken next.
    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Move everything left in the in-flight list back to the head of the queue, keeping
    /// the original order. Returns how many items were moved.
    async fn recover(&self) -> Result<usize, QueueError>;
}
