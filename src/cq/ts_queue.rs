//! Bounded thread-safe FIFO used by the async enqueue path.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// A blocking MPSC-style queue with a fixed capacity.
pub struct TsQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

impl<T> TsQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            inner: Mutex::new(Inner { items: VecDeque::new(), capacity, closed: false }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Push an item, blocking while the queue is full. Items pushed after
    /// close are dropped.
    pub fn push(&self, item: T) {
        let mut inner = self.inner.lock().expect("queue lock");
        while inner.items.len() == inner.capacity && !inner.closed {
            inner = self.not_full.wait(inner).expect("queue lock");
        }
        if inner.closed {
            return;
        }
        inner.items.push_back(item);
        self.not_empty.notify_one();
    }

    /// Pop the next item, blocking while the queue is empty. Returns `None`
    /// once the queue is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().expect("queue lock");
        loop {
            if let Some(item) = inner.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            inner = self.not_empty.wait(inner).expect("queue lock");
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the queue: wakes every waiter; `pop` drains what remains.
    pub fn close(&self) {
        self.inner.lock().expect("queue lock").closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let q = TsQueue::new(4);
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
    }

    #[test]
    fn test_push_blocks_at_capacity() {
        let q = Arc::new(TsQueue::new(1));
        q.push(1);
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.push(2));
        thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop(), Some(1));
        handle.join().unwrap();
        assert_eq!(q.pop(), Some(2));
    }

    #[test]
    fn test_close_drains_then_ends() {
        let q = TsQueue::new(4);
        q.push(7);
        q.close();
        assert_eq!(q.pop(), Some(7));
        assert_eq!(q.pop(), None);
    }
}
