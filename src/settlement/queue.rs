//! Bounded hand-off between request handlers and the reconciliation worker.
//!
//! Producers wait for capacity instead of dropping orders; the single
//! consumer drains whatever is buffered without waiting.

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::ledger::models::PendingOrder;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Order queue is closed")]
pub struct QueueClosed;

/// Producer side. Cheap to clone; one per request handler if needed.
#[derive(Clone)]
pub struct OrderQueue {
    sender: mpsc::Sender<PendingOrder>,
}

/// Consumer side, owned by the reconciliation worker.
pub struct OrderDrain {
    receiver: mpsc::Receiver<PendingOrder>,
}

impl OrderQueue {
    pub fn bounded(capacity: usize) -> (OrderQueue, OrderDrain) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (OrderQueue { sender }, OrderDrain { receiver })
    }

    /// Wait for a free slot and push the order.
    pub async fn enqueue(&self, order: PendingOrder) -> Result<(), QueueClosed> {
        self.sender.send(order).await.map_err(|_| QueueClosed)
    }
}

impl OrderDrain {
    /// Take everything currently buffered. Never waits.
    pub fn drain(&mut self) -> Vec<PendingOrder> {
        let mut batch = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(order) => batch.push(order),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pending(id: i64) -> PendingOrder {
        PendingOrder {
            order_id: id,
            order_number: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_drain_on_empty_queue_returns_nothing() {
        let (_queue, mut drain) = OrderQueue::bounded(4);
        assert!(drain.drain().is_empty());
    }

    #[tokio::test]
    async fn test_drain_takes_whole_batch() {
        let (queue, mut drain) = OrderQueue::bounded(4);
        for id in 1..=3 {
            queue.enqueue(pending(id)).await.unwrap();
        }

        let batch = drain.drain();
        assert_eq!(batch.len(), 3);
        assert!(drain.drain().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_waits_while_full() {
        let (queue, mut drain) = OrderQueue::bounded(1);
        queue.enqueue(pending(1)).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), queue.enqueue(pending(2))).await;
        assert!(blocked.is_err(), "enqueue should wait for capacity");

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(pending(3)).await })
        };
        tokio::task::yield_now().await;

        assert_eq!(drain.drain(), vec![pending(1)]);
        producer.await.unwrap().unwrap();
        assert_eq!(drain.drain(), vec![pending(3)]);
    }

    #[tokio::test]
    async fn test_enqueue_fails_once_consumer_is_gone() {
        let (queue, drain) = OrderQueue::bounded(1);
        drop(drain);
        assert_eq!(queue.enqueue(pending(1)).await, Err(QueueClosed));
    }
}
