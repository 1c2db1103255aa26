use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Called after every push, e.g. to wake up a selector that is waiting for the queue to become
///  non-empty. It is called without the queue's lock held.
pub type PushListener = Arc<dyn Fn() + Send + Sync>;

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Unbounded FIFO queue shared between threads. Producers never block, consumers can block
///  until an item is available, with or without a time limit.
///
/// Closing the queue releases all blocked consumers; items that are still queued can be drained
///  after closing, but no new items are accepted.
pub struct BlockingQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    push_listener: Option<PushListener>,
}

impl <T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl <T> BlockingQueue<T> {
    pub fn new() -> BlockingQueue<T> {
        BlockingQueue {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            push_listener: None,
        }
    }

    pub fn with_push_listener(push_listener: PushListener) -> BlockingQueue<T> {
        BlockingQueue {
            push_listener: Some(push_listener),
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        // a panicking producer or consumer leaves the deque itself in a consistent state
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns `false` if the queue was closed, dropping the item
    pub fn push(&self, item: T) -> bool {
        {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            state.items.push_back(item);
        }
        self.not_empty.notify_one();

        if let Some(listener) = &self.push_listener {
            listener();
        }
        true
    }

    /// Blocks until an item is available. Returns `None` only if the queue is closed and empty.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self.not_empty.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Blocks for at most `max_wait`.
    pub fn pop_timeout(&self, max_wait: Duration) -> Option<T> {
        let deadline = Instant::now() + max_wait;

        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self.not_empty.wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Removes and returns all currently queued items without blocking
    pub fn drain(&self) -> Vec<T> {
        self.lock().items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
