use std::time::Duration;

use ::redis::aio::{Connection, MultiplexedConnection};
use ::redis::{Client, RedisError};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Delivery, EventQueue, QueueError};

/// A queue backed by a Redis list.
///
/// Items are appended with `RPUSH` and taken from the head with `BLMOVE` into a list owned by
/// this consumer (`<queue_key>:inflight:<consumer>`). Acknowledging removes the item from that
/// list; everything still there when a consumer restarts is pushed back by `recover`.
pub struct RedisQueue {
    client: Client,
    connection: MultiplexedConnection,
    /// Blocking commands would stall every request sharing the multiplexed connection, so
    /// takes get their own. Dropped after an error and reopened on the next take.
    blocking: Mutex<Option<Connection>>,
    queue_key: String,
    /// `None` for producers, which only ever append.
    inflight_key: Option<String>,
}

impl RedisQueue {
    /// A queue handle for `consumer`, taking into its own in-flight list.
    pub async fn new(url: &str, queue_key: &str, consumer: &str) -> Result<Self, QueueError> {
        Self::connect(url, queue_key, Some(format!("{queue_key}:inflight:{consumer}"))).await
    }

    /// A queue handle that can only append.
    pub async fn producer(url: &str, queue_key: &str) -> Result<Self, QueueError> {
        Self::connect(url, queue_key, None).await
    }

    async fn connect(
        url: &str,
        queue_key: &str,
        inflight_key: Option<String>,
    ) -> Result<Self, QueueError> {
        let client = Client::open(url).map_err(QueueError::ConnectionError)?;
        let connection = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(QueueError::ConnectionError)?;

        Ok(Self {
            client,
            connection,
            blocking: Mutex::new(None),
            queue_key: queue_key.to_owned(),
            inflight_key,
        })
    }

    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }

    pub fn inflight_key(&self) -> Option<&str> {
        self.inflight_key.as_deref()
    }

    fn consumer_key(&self) -> Result<&str, QueueError> {
        self.inflight_key().ok_or(QueueError::ProducerOnly)
    }

    async fn blmove(
        &self,
        connection: &mut Connection,
        inflight_key: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>, RedisError> {
        // 0 blocks forever
        let seconds = timeout.map_or(0.0, |t| t.as_secs_f64());

        ::redis::cmd("BLMOVE")
            .arg(&self.queue_key)
            .arg(inflight_key)
            .arg("LEFT")
            .arg("LEFT")
            .arg(seconds)
            .query_async(connection)
            .await
    }
}

#[async_trait]
impl EventQueue for RedisQueue {
    async fn append(&self, payload: Vec<u8>) -> Result<(), QueueError> {
        let mut connection = self.connection.clone();

        ::redis::cmd("RPUSH")
            .arg(&self.queue_key)
            .arg(payload)
            .query_async::<_, ()>(&mut connection)
            .await
            .map_err(|error| QueueError::CommandError {
                command: "RPUSH",
                error,
            })
    }

    async fn take(&self, timeout: Option<Duration>) -> Result<Option<Delivery>, QueueError> {
        let inflight_key = self.consumer_key()?;
        let mut slot = self.blocking.lock().await;

        let mut connection = match slot.take() {
            Some(connection) => connection,
            None => {
                debug!("opening blocking connection for {}", self.queue_key);
                self.client
                    .get_async_connection()
                    .await
                    .map_err(QueueError::ConnectionError)?
            }
        };

        match self.blmove(&mut connection, inflight_key, timeout).await {
            Ok(item) => {
                *slot = Some(connection);
                Ok(item.map(|payload| Delivery::new(payload, 0)))
            }
            Err(error) => {
                warn!("dropping blocking connection after error: {}", error);
                Err(QueueError::CommandError {
                    command: "BLMOVE",
                    error,
                })
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let inflight_key = self.consumer_key()?;
        let mut connection = self.connection.clone();

        ::redis::cmd("LREM")
            .arg(inflight_key)
            .arg(1)
            .arg(&delivery.payload)
            .query_async::<_, ()>(&mut connection)
            .await
            .map_err(|error| QueueError::CommandError {
                command: "LREM",
                error,
            })
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let inflight_key = self.consumer_key()?;
        let mut connection = self.connection.clone();

        ::redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(inflight_key)
            .arg(1)
            .arg(&delivery.payload)
            .ignore()
            .cmd("LPUSH")
            .arg(&self.queue_key)
            .arg(&delivery.payload)
            .ignore()
            .query_async::<_, ()>(&mut connection)
            .await
            .map_err(|error| QueueError::CommandError {
                command: "MULTI",
                error,
            })
    }

    async fn recover(&self) -> Result<usize, QueueError> {
        let inflight_key = self.consumer_key()?;
        let mut connection = self.connection.clone();
        let mut moved = 0;

        // The newest in-flight item sits on the left; pushing each one onto the head of the
        // queue in turn leaves the oldest first.
        loop {
            let item: Option<Vec<u8>> = ::redis::cmd("LMOVE")
                .arg(inflight_key)
                .arg(&self.queue_key)
                .arg("LEFT")
                .arg("LEFT")
                .query_async(&mut connection)
                .await
                .map_err(|error| QueueError::CommandError {
                    command: "LMOVE",
                    error,
                })?;

            match item {
                Some(_) => moved += 1,
                None => return Ok(moved),
            }
        }
    }
}
