//! Bounded blocking FIFO.
//!
//! The admission path's sole synchronization primitive: producers use the
//! non-blocking `offer`, the consumer waits with `poll_timeout`/`take`, and
//! the timeout handler claims a specific element with `remove_where`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Fixed-capacity FIFO with blocking and non-blocking entry points.
pub struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedQueue<T> {
    /// New queue holding at most `capacity` elements.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be nonzero");
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Maximum number of elements.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of elements.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Append without blocking; hands the element back if the queue is full.
    pub fn offer(&self, item: T) -> Result<(), T> {
        let mut queue = self.inner.lock();
        if queue.len() >= self.capacity {
            return Err(item);
        }
        queue.push_back(item);
        drop(queue);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Append, waiting for space if the queue is full.
    pub fn put(&self, item: T) {
        let mut queue = self.inner.lock();
        while queue.len() >= self.capacity {
            self.not_full.wait(&mut queue);
        }
        queue.push_back(item);
        drop(queue);
        self.not_empty.notify_one();
    }

    /// Remove the head without blocking.
    pub fn poll(&self) -> Option<T> {
        let mut queue = self.inner.lock();
        let item = queue.pop_front();
        drop(queue);
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Remove the head, waiting up to `timeout` for one to appear.
    pub fn poll_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.inner.lock();
        loop {
            if let Some(item) = queue.pop_front() {
                drop(queue);
                self.not_full.notify_one();
                return Some(item);
            }
            if Instant::now() >= deadline {
                return None;
            }
            if self.not_empty.wait_until(&mut queue, deadline).timed_out() {
                let item = queue.pop_front();
                drop(queue);
                if item.is_some() {
                    self.not_full.notify_one();
                }
                return item;
            }
        }
    }

    /// Remove the head, waiting as long as it takes.
    pub fn take(&self) -> T {
        let mut queue = self.inner.lock();
        loop {
            if let Some(item) = queue.pop_front() {
                drop(queue);
                self.not_full.notify_one();
                return item;
            }
            self.not_empty.wait(&mut queue);
        }
    }

    /// Remove and return the first element matching `pred`, if any.
    pub fn remove_where(&self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        let mut queue = self.inner.lock();
        let position = queue.iter().position(|item| pred(item))?;
        let item = queue.remove(position);
        drop(queue);
        self.not_full.notify_one();
        item
    }
}
