//! Bounded blocking FIFO between the TCP listener and the FIX dispatcher.
//!
//! The queue decouples socket reads from parsing: the listener blocks when
//! the dispatcher falls behind (backpressure), the dispatcher blocks when
//! there is nothing to parse. `close()` is terminal: it wakes every waiter,
//! fails subsequent pushes, and lets pending items drain before `pop`
//! starts reporting exhaustion.
//!
//! Consumers see the queue through the [`IngressQueue`] capability so a
//! lock-free implementation can replace the mutex+condvar one without
//! touching the listener or dispatcher.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// Push failure: the only way a push can fail is a closed queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("push on closed queue")]
pub struct PushError;

/// Capability offered to the listener (push/close) and dispatcher (pop).
pub trait IngressQueue<T>: Send + Sync {
    /// Blocks while the queue is full; fails once the queue is closed.
    fn push(&self, item: T) -> Result<(), PushError>;

    /// Blocks while the queue is empty and open. Returns `None` exactly when
    /// the queue is closed *and* drained, which is the dispatcher's exit signal.
    fn pop(&self) -> Option<T>;

    /// Terminal: wakes all waiters, rejects future pushes.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Mutex+condvar implementation of [`IngressQueue`].
pub struct BlockingQueue<T> {
    state: Mutex<State<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
}

impl<T> BlockingQueue<T> {
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be greater than 0");
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send> IngressQueue<T> for BlockingQueue<T> {
    fn push(&self, item: T) -> Result<(), PushError> {
        let mut state = self.state.lock();
        self.not_full
            .wait_while(&mut state, |s| s.items.len() >= self.capacity && !s.closed);

        if state.closed {
            return Err(PushError);
        }

        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        self.not_empty
            .wait_while(&mut state, |s| s.items.is_empty() && !s.closed);

        match state.items.pop_front() {
            Some(item) => {
                drop(state);
                self.not_full.notify_one();
                Some(item)
            }
            // Woken by close with nothing left: drained.
            None => None,
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order_preserved() {
        let queue = BlockingQueue::new(8);
        for i in 0..5 {
            queue.push(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(queue.pop(), Some(i));
        }
    }

    #[test]
    fn pop_on_closed_and_empty_returns_none() {
        let queue: BlockingQueue<u32> = BlockingQueue::new(4);
        queue.close();
        assert_eq!(queue.pop(), None);
        // And keeps returning None for every subsequent waiter.
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn close_drains_pending_items_first() {
        let queue = BlockingQueue::new(4);
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        queue.close();
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn push_after_close_fails() {
        let queue = BlockingQueue::new(4);
        queue.close();
        assert_eq!(queue.push(1), Err(PushError));
        assert!(queue.is_closed());
    }

    #[test]
    fn close_wakes_blocked_poppers() {
        let queue: Arc<BlockingQueue<u32>> = Arc::new(BlockingQueue::new(4));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let q = Arc::clone(&queue);
            handles.push(thread::spawn(move || q.pop()));
        }
        thread::sleep(Duration::from_millis(50));
        queue.close();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), None);
        }
    }

    #[test]
    fn full_queue_blocks_push_until_pop() {
        let queue = Arc::new(BlockingQueue::new(1));
        queue.push(1u32).unwrap();

        let q = Arc::clone(&queue);
        let pusher = thread::spawn(move || q.push(2).unwrap());

        thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.len(), 1, "push must block while full");

        assert_eq!(queue.pop(), Some(1));
        pusher.join().unwrap();
        assert_eq!(queue.pop(), Some(2));
    }

    #[test]
    fn close_wakes_blocked_pushers() {
        let queue = Arc::new(BlockingQueue::new(1));
        queue.push(1u32).unwrap();

        let q = Arc::clone(&queue);
        let pusher = thread::spawn(move || q.push(2));

        thread::sleep(Duration::from_millis(50));
        queue.close();
        assert_eq!(pusher.join().unwrap(), Err(PushError));
    }
}
