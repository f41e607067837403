//! Bounded intake queue shared by every producer and every worker

use crate::error::{BatchError, Result};
use crate::event::EventRecord;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};

/// Producer side of the batch queue
#[derive(Debug)]
pub struct BatchQueue {
    sender: RwLock<Option<mpsc::Sender<EventRecord>>>,
    capacity: usize,
    enqueue_timeout: Duration,
}

/// Consumer side, cloned into every worker
#[derive(Debug, Clone)]
pub(crate) struct QueueConsumer {
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<EventRecord>>>,
}

impl BatchQueue {
    pub(crate) fn new(capacity: usize, enqueue_timeout: Duration) -> (Self, QueueConsumer) {
        let (sender, receiver) = mpsc::channel(capacity);
        let queue = Self { sender: RwLock::new(Some(sender)), capacity, enqueue_timeout };
        let consumer = QueueConsumer { receiver: Arc::new(tokio::sync::Mutex::new(receiver)) };
        (queue, consumer)
    }

    /// Wait up to the enqueue timeout for space, then give up
    pub async fn enqueue(&self, record: EventRecord) -> Result<()> {
        // Clone out so the lock is not held across the wait
        let sender = self.sender.read().clone().ok_or(BatchError::ShuttingDown)?;

        match sender.send_timeout(record, self.enqueue_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(BatchError::QueueSaturated {
                timeout_ms: self.enqueue_timeout.as_millis() as u64,
            }),
            Err(SendTimeoutError::Closed(_)) => Err(BatchError::ShuttingDown),
        }
    }

    /// Stop accepting records. Workers see the channel close once in-flight
    /// producers finish. Returns false if already closed.
    pub fn close(&self) -> bool {
        self.sender.write().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }

    /// Records waiting to be picked up by a worker
    pub fn depth(&self) -> usize {
        match self.sender.read().as_ref() {
            Some(sender) => self.capacity.saturating_sub(sender.capacity()),
            None => 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl QueueConsumer {
    /// Next record, or `None` once the queue is closed and empty. Cancel-safe.
    pub(crate) async fn recv(&self) -> Option<EventRecord> {
        self.receiver.lock().await.recv().await
    }
}
