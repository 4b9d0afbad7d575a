use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, StreamError};
use crate::media::types::AdmissionPolicy;

/// Log "queue full" at most every N drops so drop storms stay readable.
const DROP_LOG_INTERVAL: u64 = 120;

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Result of a timed dequeue.
pub enum TimedDequeue<T> {
    Item(T),
    /// Nothing arrived within the deadline; the queue is still open.
    Empty,
    Closed,
}

/// Bounded FIFO shared between the ingestion side and the single
/// projector consumer. The only mutable structure crossing that boundary;
/// internally synchronized, strict FIFO.
pub struct FrameQueue<T> {
    inner: Mutex<Inner<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
    policy: AdmissionPolicy,
    dropped: AtomicU64,
}

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize, policy: AdmissionPolicy) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity,
            policy,
            dropped: AtomicU64::new(0),
        }
    }

    /// Admit one item. Blocking policy suspends until space frees up;
    /// drop policy returns `Ok(false)` and counts the drop. Returns
    /// `QueueClosed` once the queue has been shut down, including while
    /// blocked waiting for space.
    pub fn enqueue(&self, item: T) -> Result<bool> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(StreamError::QueueClosed);
            }
            if inner.items.len() < self.capacity {
                inner.items.push_back(item);
                self.not_empty.notify_one();
                return Ok(true);
            }
            match self.policy {
                AdmissionPolicy::Blocking => self.not_full.wait(&mut inner),
                AdmissionPolicy::Drop => {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped % DROP_LOG_INTERVAL == 1 {
                        log::warn!("frame queue full, dropped {} frames so far", dropped);
                    }
                    return Ok(false);
                }
            }
        }
    }

    /// Take the oldest item, blocking until one is available. `None`
    /// means the queue was shut down and emptied.
    pub fn dequeue(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            self.not_empty.wait(&mut inner);
        }
    }

    /// Like `dequeue` but gives up after `timeout`; used by fixed-interval
    /// pacing to tolerate underrun.
    pub fn dequeue_timeout(&self, timeout: Duration) -> TimedDequeue<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                self.not_full.notify_one();
                return TimedDequeue::Item(item);
            }
            if inner.closed {
                return TimedDequeue::Closed;
            }
            if self.not_empty.wait_until(&mut inner, deadline).timed_out() {
                return TimedDequeue::Empty;
            }
        }
    }

    /// Shut the queue down: no further enqueues are accepted and every
    /// blocked party is woken. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if !inner.closed {
            inner.closed = true;
            self.not_empty.notify_all();
            self.not_full.notify_all();
        }
    }

    /// Discard everything still resident. Returns the number discarded.
    pub fn drain(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.items.len();
        inner.items.clear();
        self.not_full.notify_all();
        n
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Total frames rejected under the drop policy.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[path = "queue_test.rs"]
mod queue_test;
