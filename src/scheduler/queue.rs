use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;

/// Bounded hand-off queue between scheduler tasks.
///
/// Cloning yields another handle to the same queue. Any number of handles may
/// send or receive; concurrent receivers take turns on the shared receiver.
pub struct Queue<T> {
    tx: mpsc::Sender<T>,
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: Arc::clone(&self.rx),
        }
    }
}

impl<T> Queue<T> {
    /// Creates a queue holding at most `capacity` items. `capacity` must be positive.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Enqueue without waiting. Returns the item back when the queue is full.
    pub fn try_send(&self, item: T) -> Result<(), T> {
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(item)) | Err(TrySendError::Closed(item)) => Err(item),
        }
    }

    /// Enqueue, waiting for space when the queue is full.
    ///
    /// Cancel-safe: dropping the future before it completes never enqueues.
    pub async fn send(&self, item: T) -> Result<(), T> {
        self.tx.send(item).await.map_err(|e| e.0)
    }

    /// Wait for the next item.
    ///
    /// Cancel-safe: dropping the future never loses an item. Returns `None`
    /// only if every sender is gone, which cannot happen while `self` lives.
    pub async fn recv(&self) -> Option<T> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    /// Take an item if one is immediately available.
    pub fn try_recv(&self) -> Option<T> {
        let mut rx = self.rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}
