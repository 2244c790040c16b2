use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Delivery, EventQueue, QueueError};

/// An in-process `EventQueue` with the same take/ack semantics as `RedisQueue`.
/// Clones share the same underlying queue.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    available: Notify,
}

#[derive(Default)]
struct State {
    pending: VecDeque<Vec<u8>>,
    inflight: Vec<Delivery>,
    next_receipt: u64,
    closed: bool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make every following operation fail, as an unreachable server would.
    pub fn close(&self) {
        self.lock().closed = true;
        self.inner.available.notify_waiters();
    }

    pub fn reopen(&self) {
        self.lock().closed = false;
    }

    /// Payloads waiting to be taken, head first.
    pub fn pending(&self) -> Vec<Vec<u8>> {
        self.lock().pending.iter().cloned().collect()
    }

    /// Payloads taken but not acknowledged yet, oldest first.
    pub fn inflight(&self) -> Vec<Vec<u8>> {
        self.lock()
            .inflight
            .iter()
            .map(|delivery| delivery.payload.clone())
            .collect()
    }

    fn try_take(&self) -> Result<Option<Delivery>, QueueError> {
        let mut state = self.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }

        let Some(payload) = state.pending.pop_front() else {
            return Ok(None);
        };

        state.next_receipt += 1;
        let delivery = Delivery::new(payload, state.next_receipt);
        state.inflight.push(delivery.clone());

        Ok(Some(delivery))
    }

    fn remove_inflight(state: &mut State, delivery: &Delivery) -> bool {
        match state
            .inflight
            .iter()
            .position(|held| held.receipt() == delivery.receipt())
        {
            Some(index) => {
                state.inflight.remove(index);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl EventQueue for MemoryQueue {
    async fn append(&self, payload: Vec<u8>) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            state.pending.push_back(payload);
        }
        self.inner.available.notify_one();

        Ok(())
    }

    async fn take(&self, timeout: Option<Duration>) -> Result<Option<Delivery>, QueueError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            if let Some(delivery) = self.try_take()? {
                return Ok(Some(delivery));
            }

            // notify_one leaves a permit behind when nobody is waiting, so an append that
            // lands between try_take and here still wakes us up.
            match deadline {
                Some(deadline) => {
                    let wait = tokio::time::timeout_at(deadline, self.inner.available.notified());
                    if wait.await.is_err() {
                        return self.try_take();
                    }
                }
                None => self.inner.available.notified().await,
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        Self::remove_inflight(&mut state, delivery);

        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            if Self::remove_inflight(&mut state, delivery) {
                state.pending.push_front(delivery.payload.clone());
            }
        }
        self.inner.available.notify_one();

        Ok(())
    }

    async fn recover(&self) -> Result<usize, QueueError> {
        let moved = {
            let mut state = self.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            let inflight = std::mem::take(&mut state.inflight);
            let moved = inflight.len();
            for delivery in inflight.into_iter().rev() {
                state.pending.push_front(delivery.payload);
            }
            moved
        };
        if moved > 0 {
            self.inner.available.notify_one();
        }

        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Option<Duration> = Some(Duration::from_millis(20));

    #[tokio::test]
    async fn takes_in_append_order() {
        let queue = MemoryQueue::new();
        queue.append(b"a".to_vec()).await.unwrap();
        queue.append(b"b".to_vec()).await.unwrap();

        let a = queue.take(SHORT).await.unwrap().unwrap();
        let b = queue.take(SHORT).await.unwrap().unwrap();

        assert_eq!(a.payload, b"a");
        assert_eq!(b.payload, b"b");
        assert_eq!(queue.take(SHORT).await.unwrap(), None);
    }

    #[tokio::test]
    async fn take_waits_for_an_append() {
        let queue = MemoryQueue::new();
        let producer = queue.clone();

        let waiter = tokio::spawn(async move { queue.take(None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        producer.append(b"late".to_vec()).await.unwrap();

        let delivery = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.payload, b"late");
    }

    #[tokio::test]
    async fn ack_forgets_and_nack_puts_back_at_head() {
        let queue = MemoryQueue::new();
        for payload in [b"a", b"b", b"c"] {
            queue.append(payload.to_vec()).await.unwrap();
        }

        let a = queue.take(SHORT).await.unwrap().unwrap();
        assert_eq!(queue.inflight(), vec![b"a".to_vec()]);
        queue.ack(&a).await.unwrap();
        assert!(queue.inflight().is_empty());

        let b = queue.take(SHORT).await.unwrap().unwrap();
        queue.nack(&b).await.unwrap();

        assert_eq!(queue.pending(), vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[tokio::test]
    async fn recover_keeps_original_order() {
        let queue = MemoryQueue::new();
        for payload in [b"a", b"b", b"c"] {
            queue.append(payload.to_vec()).await.unwrap();
        }
        let _a = queue.take(SHORT).await.unwrap().unwrap();
        let _b = queue.take(SHORT).await.unwrap().unwrap();

        assert_eq!(queue.recover().await.unwrap(), 2);
        assert_eq!(
            queue.pending(),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
        assert!(queue.inflight().is_empty());
    }

    #[tokio::test]
    async fn closed_queue_refuses_everything() {
        let queue = MemoryQueue::new();
        queue.close();

        assert!(matches!(
            queue.append(b"a".to_vec()).await,
            Err(QueueError::Closed)
        ));
        assert!(matches!(queue.take(SHORT).await, Err(QueueError::Closed)));

        queue.reopen();
        queue.append(b"a".to_vec()).await.unwrap();
        assert_eq!(queue.pending().len(), 1);
    }
}
