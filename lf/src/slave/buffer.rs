//! Bounded FIFO buffer for updates and metrics
//!
//! Holds emissions while disconnected; drained in FIFO order on flush.
//! Overflow drops the oldest item and counts the loss, which the slave
//! reports in subsequent metrics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Mutex-guarded ring with a drop-oldest overflow policy
pub struct BoundedBuffer<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> BoundedBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, item: T) {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        if items.len() >= self.capacity {
            items.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        items.push_back(item);
    }

    /// Drain up to `max` items in FIFO order
    pub fn drain(&self, max: usize) -> Vec<T> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        let n = items.len().min(max);
        items.drain(..n).collect()
    }

    /// Put items back at the front (flush failed mid-way)
    pub fn requeue_front(&self, mut batch: Vec<T>) {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(item) = batch.pop() {
            if items.len() >= self.capacity {
                items.pop_back();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            items.push_front(item);
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dropped-count since the last call, resetting the counter
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }
}
