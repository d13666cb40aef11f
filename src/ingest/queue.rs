//! Bounded hand-off between ingestors and the executor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::models::TradeIntent;

/// Why a non-blocking push failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("intent queue is full")]
    Full,
    #[error("intent queue is closed")]
    Closed,
}

/// Bounded FIFO of validated intents.
///
/// Producers clone the sender side freely; the receiver sits behind an async
/// mutex so there is exactly one consumer at a time. The queue lives in an
/// `Arc` owned by the ingestor, so stopping a transport task never drops
/// intents that were already enqueued.
#[derive(Clone)]
pub struct IntentQueue {
    tx: mpsc::Sender<TradeIntent>,
    rx: Arc<Mutex<mpsc::Receiver<TradeIntent>>>,
    capacity: usize,
}

impl IntentQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue, waiting for capacity.
    pub async fn push(&self, intent: TradeIntent) -> Result<(), QueueError> {
        self.tx.send(intent).await.map_err(|_| QueueError::Closed)
    }

    /// Enqueue without waiting.
    pub fn try_push(&self, intent: TradeIntent) -> Result<(), QueueError> {
        self.tx.try_send(intent).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    /// Wait for a free slot. The slot is held until the permit is used or dropped.
    pub async fn reserve(&self) -> Result<mpsc::Permit<'_, TradeIntent>, QueueError> {
        self.tx.reserve().await.map_err(|_| QueueError::Closed)
    }

    /// Take a free slot without waiting.
    pub fn try_reserve(&self) -> Result<mpsc::Permit<'_, TradeIntent>, QueueError> {
        self.tx.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => QueueError::Full,
            mpsc::error::TrySendError::Closed(()) => QueueError::Closed,
        })
    }

    /// Next intent in arrival order, or `None` once `timeout` elapses.
    pub async fn pop(&self, timeout: Duration) -> Option<TradeIntent> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    pub fn depth(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::firewall_fixtures::payload;
    use chrono::Utc;

    fn intent(id: &str) -> TradeIntent {
        TradeIntent::from_value(payload(id, Utc::now())).unwrap()
    }

    #[tokio::test]
    async fn test_fifo_order_and_depth() {
        let queue = IntentQueue::new(4);
        queue.push(intent("a")).await.unwrap();
        queue.push(intent("b")).await.unwrap();
        assert_eq!(queue.depth(), 2);

        let first = queue.pop(Duration::from_millis(10)).await.unwrap();
        let second = queue.pop(Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.intent_id(), "a");
        assert_eq!(second.intent_id(), "b");
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_pop_times_out_when_empty() {
        let queue = IntentQueue::new(1);
        assert!(queue.pop(Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn test_try_push_reports_full() {
        let queue = IntentQueue::new(1);
        queue.try_push(intent("a")).unwrap();
        assert_eq!(queue.try_push(intent("b")), Err(QueueError::Full));
    }

    #[tokio::test]
    async fn test_reserved_slot_counts_against_capacity() {
        let queue = IntentQueue::new(1);
        let permit = queue.try_reserve().unwrap();
        assert_eq!(queue.try_reserve().err(), Some(QueueError::Full));

        permit.send(intent("a"));
        assert_eq!(queue.depth(), 1);
        assert_eq!(queue.pop(Duration::from_millis(10)).await.unwrap().intent_id(), "a");
        assert!(queue.try_reserve().is_ok());
    }
}
