//! Drain the event queue into the store, one delivery at a time.
use std::sync::Arc;
use std::time::Duration;

use analytics_common::event::QueuedEvent;
use analytics_common::health::HealthHandle;
use analytics_common::queue::{Delivery, EventQueue, QueueError};
use analytics_common::store::{EventStore, StoreError};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often the loop reports liveness while blocked on an empty queue.
pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(10);

/// Where the consumer loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    /// Blocked on the queue, holding nothing.
    Waiting,
    /// Holding one delivery that is not acked or nacked yet.
    Processing,
    /// Sleeping after a failure before taking again.
    BackingOff,
}

impl ConsumerState {
    fn as_gauge(self) -> f64 {
        match self {
            ConsumerState::Waiting => 0.0,
            ConsumerState::Processing => 1.0,
            ConsumerState::BackingOff => 2.0,
        }
    }
}

/// Why a delivery was acknowledged without producing a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropCause {
    Malformed,
    InvalidTimestamp,
    Rejected,
}

impl DropCause {
    pub fn as_str(self) -> &'static str {
        match self {
            DropCause::Malformed => "malformed",
            DropCause::InvalidTimestamp => "invalid_timestamp",
            DropCause::Rejected => "rejected",
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Stored,
    Dropped(DropCause),
    /// Put back at the head of the queue after a transient store failure.
    Requeued,
}

impl Outcome {
    fn needs_backoff(self) -> bool {
        matches!(
            self,
            Outcome::Requeued | Outcome::Dropped(DropCause::Rejected)
        )
    }
}

pub struct Consumer {
    /// Identifies the in-flight list of this consumer, for logs.
    name: String,
    queue: Arc<dyn EventQueue>,
    store: Arc<dyn EventStore>,
    /// Fixed pause after a queue or store failure.
    backoff_interval: Duration,
    /// Upper bound on a single blocking take; `None` blocks until an item arrives.
    take_timeout: Option<Duration>,
    /// The liveness check handle, reported on every pass through Waiting and every
    /// `liveness_interval` while blocked in a take.
    liveness: HealthHandle,
    liveness_interval: Duration,
    state: watch::Sender<ConsumerState>,
}

impl Consumer {
    pub fn new(
        name: &str,
        queue: Arc<dyn EventQueue>,
        store: Arc<dyn EventStore>,
        backoff_interval: Duration,
        take_timeout: Option<Duration>,
        liveness: HealthHandle,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Waiting);

        Self {
            name: name.to_owned(),
            queue,
            store,
            backoff_interval,
            take_timeout,
            liveness,
            liveness_interval: LIVENESS_INTERVAL,
            state,
        }
    }

    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    /// Follow the state of the loop.
    pub fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConsumerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(?state, "consumer state changed");
        }
        metrics::gauge!("analytics_consumer_state").set(state.as_gauge());
    }

    /// Put back whatever a previous run of this consumer left in flight.
    pub async fn recover(&self) -> Result<usize, QueueError> {
        let recovered = self.queue.recover().await?;
        if recovered > 0 {
            warn!(
                consumer = %self.name,
                recovered, "requeued deliveries left in flight by a previous run"
            );
            metrics::counter!("analytics_events_requeued_total").increment(recovered as u64);
        }
        Ok(recovered)
    }

    /// Run until `cancel` fires. Cancellation is only observed between deliveries, so
    /// whatever is being processed is acked or nacked before this returns.
    ///
    /// A delivery the queue failed to settle stays in flight; it is recovered to the head of
    /// the queue before anything else is taken.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(consumer = %self.name, "consumer started");
        let mut unsettled = false;

        'consume: loop {
            self.set_state(ConsumerState::Waiting);
            self.liveness.report_healthy().await;

            if unsettled {
                match self.recover().await {
                    Ok(_) => unsettled = false,
                    Err(err) => {
                        error!("failed to requeue unsettled deliveries: {}", err);
                        if self.back_off(&cancel).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            let take = self.queue.take(self.take_timeout);
            tokio::pin!(take);
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + self.liveness_interval,
                self.liveness_interval,
            );
            let taken = loop {
                tokio::select! {
                    _ = cancel.cancelled() => break 'consume,
                    taken = &mut take => break taken,
                    _ = ticker.tick() => self.liveness.report_healthy().await,
                }
            };

            let delivery = match taken {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(err) => {
                    error!("failed to take from queue: {}", err);
                    unsettled = true;
                    if self.back_off(&cancel).await {
                        break;
                    }
                    continue;
                }
            };

            self.set_state(ConsumerState::Processing);
            let back_off = match self.process(&delivery).await {
                Ok(outcome) => outcome.needs_backoff(),
                Err(err) => {
                    error!("failed to settle delivery: {}", err);
                    unsettled = true;
                    true
                }
            };

            if back_off && self.back_off(&cancel).await {
                break;
            }
        }

        info!(consumer = %self.name, "consumer stopped");
    }

    /// Sleep for the backoff interval. Returns true if cancelled meanwhile.
    async fn back_off(&self, cancel: &CancellationToken) -> bool {
        self.set_state(ConsumerState::BackingOff);

        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(self.backoff_interval) => false,
        }
    }

    /// Turn one delivery into a record, then ack or nack it. Errors are only returned when
    /// the queue itself fails to settle the delivery.
    pub async fn process(&self, delivery: &Delivery) -> Result<Outcome, QueueError> {
        let event = match QueuedEvent::decode(&delivery.payload) {
            Ok(event) => event,
            Err(err) => {
                warn!("dropping malformed queue item: {}", err);
                return self.discard(delivery, DropCause::Malformed).await;
            }
        };

        let record = match event.into_record() {
            Ok(record) => record,
            Err(err) => {
                warn!("dropping event: {}", err);
                return self.discard(delivery, DropCause::InvalidTimestamp).await;
            }
        };

        match self.store.insert(&record).await {
            Ok(()) => {
                self.queue.ack(delivery).await?;
                metrics::counter!("analytics_events_stored_total").increment(1);
                Ok(Outcome::Stored)
            }
            Err(err @ StoreError::Unavailable(_)) => {
                warn!(
                    site_id = %record.site_id,
                    "store unavailable, requeueing event: {}", err
                );
                self.queue.nack(delivery).await?;
                metrics::counter!("analytics_events_requeued_total").increment(1);
                Ok(Outcome::Requeued)
            }
            Err(err @ StoreError::Rejected(_)) => {
                error!(site_id = %record.site_id, "store rejected event: {}", err);
                self.discard(delivery, DropCause::Rejected).await
            }
        }
    }

    async fn discard(&self, delivery: &Delivery, cause: DropCause) -> Result<Outcome, QueueError> {
        self.queue.ack(delivery).await?;
        metrics::counter!("analytics_events_dropped_total", "cause" => cause.as_str()).increment(1);
        Ok(Outcome::Dropped(cause))
    }
}
