//! Fixed-capacity delivery queue with oldest-item eviction.
//!
//! Producers never wait: pushing into a full channel discards the oldest item.
//! Consumers wait for an item up to a timeout, which lets transport loops emit
//! keepalive probes while a stream is idle.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::pin::pin;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Why [`BoundedChannel::pop`] returned without an item.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    /// Nothing arrived before the timeout
    #[error("channel empty")]
    Empty,
    /// The channel was closed and fully drained
    #[error("channel closed")]
    Closed,
}

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
    evicted: u64,
}

/// Insertion-ordered queue that evicts its oldest item when full.
#[derive(Debug)]
pub struct BoundedChannel<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> BoundedChannel<T> {
    /// Create a channel holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner { items: VecDeque::with_capacity(capacity), closed: false, evicted: 0 }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Append `item` without blocking.
    ///
    /// Returns the evicted oldest item when the channel was full, or `item`
    /// itself when the channel is closed.
    pub fn push(&self, item: T) -> Option<T> {
        let displaced = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Some(item);
            }
            let displaced = if inner.items.len() >= self.capacity {
                inner.evicted += 1;
                inner.items.pop_front()
            } else {
                None
            };
            inner.items.push_back(item);
            displaced
        };
        self.notify.notify_waiters();
        displaced
    }

    /// Remove the oldest item if one is available.
    pub fn try_pop(&self) -> Result<T, PopError> {
        let mut inner = self.inner.lock();
        match inner.items.pop_front() {
            Some(item) => Ok(item),
            None if inner.closed => Err(PopError::Closed),
            None => Err(PopError::Empty),
        }
    }

    /// Remove the oldest item, waiting up to `timeout` for one to arrive.
    ///
    /// Only the calling task is suspended. Items pushed before [`close`](Self::close)
    /// are still delivered; after that, `Closed` is returned immediately.
    pub async fn pop(&self, timeout: Duration) -> Result<T, PopError> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut notified = pin!(self.notify.notified());
            // Register before checking so a push between the check and the
            // await is not missed.
            notified.as_mut().enable();

            match self.try_pop() {
                Err(PopError::Empty) => {}
                outcome => return outcome,
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    /// Current occupancy.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items discarded by overflow since creation.
    pub fn evicted(&self) -> u64 {
        self.inner.lock().evicted
    }

    /// Drop every queued item, returning how many were removed.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let removed = inner.items.len();
        inner.items.clear();
        removed
    }

    /// Stop accepting items and wake every waiting consumer.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl<T: Clone> BoundedChannel<T> {
    /// Copy of the queued items, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.inner.lock().items.iter().cloned().collect()
    }
}
