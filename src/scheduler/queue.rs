use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::QueueError;
use crate::scheduler::task::QueuedTask;

pub const DEFAULT_QUEUE_CAPACITY: usize = 100_000;

/// Something a worker can claim tasks from.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Remove the head task, or return `None` if nothing arrives within `timeout`.
    async fn next(&self, timeout: Duration) -> Option<QueuedTask>;
}

/// Bounded FIFO of tasks waiting for a worker instance.
///
/// Producers never wait: the capacity is meant to be large enough that a
/// full queue only happens on misconfiguration, and it is reported as an error.
#[derive(Debug)]
pub struct TaskQueue {
    tx: mpsc::Sender<QueuedTask>,
    rx: Mutex<mpsc::Receiver<QueuedTask>>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Append a task at the tail.
    pub fn put(&self, task: QueuedTask) -> Result<(), QueueError> {
        self.tx.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(task) => QueueError::Full(task),
            mpsc::error::TrySendError::Closed(task) => QueueError::Closed(task),
        })
    }

    /// Stop accepting tasks and drop the ones still queued, which resolves
    /// each of their submitters with a dispatch failure. Returns how many
    /// were dropped. Waiting consumers see an empty queue from then on.
    pub async fn close(&self) -> usize {
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut dropped = 0;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    /// Approximate number of queued tasks. May lag concurrent `put`/`next`.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub async fn next(&self, timeout: Duration) -> Option<QueuedTask> {
        // Waiting for the receiver lock counts against the timeout too.
        tokio::time::timeout(timeout, async {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        })
        .await
        .ok()
        .flatten()
    }
}

#[async_trait]
impl TaskSource for TaskQueue {
    async fn next(&self, timeout: Duration) -> Option<QueuedTask> {
        TaskQueue::next(self, timeout).await
    }
}
