use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// Bounded, thread-safe FIFO connecting two pipeline stages.
///
/// `push` blocks while the queue is at its limit; `pop` blocks while it is
/// empty. `close` wakes every waiter: pending pops drain the remaining
/// items and then observe end-of-stream, pending pushes give up. Items are
/// always moved, never copied.
pub struct Queue<T> {
    limit: usize,
    state: Mutex<State<T>>,
    items: Condvar,
    space: Condvar,
}

struct State<T> {
    buf: VecDeque<T>,
    closed: bool,
}

/// Default depth between stages: deep enough to absorb jitter, shallow
/// enough that backpressure reaches the source fast.
const DEFAULT_LIMIT: usize = 10;

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::bounded(DEFAULT_LIMIT)
    }
}

impl<T> Queue<T> {
    /// A queue holding at most `limit` items. A limit of 0 means unbounded.
    pub fn bounded(limit: usize) -> Self {
        Self {
            limit,
            state: Mutex::new(State {
                buf: VecDeque::new(),
                closed: false,
            }),
            items: Condvar::new(),
            space: Condvar::new(),
        }
    }

    pub fn unbounded() -> Self {
        Self::bounded(0)
    }

    /// Move `item` into the queue, blocking while it is full.
    /// Returns `false` if the queue was closed before the item fit.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.state.lock();
        if self.limit != 0 {
            while state.buf.len() >= self.limit && !state.closed {
                self.space.wait(&mut state);
            }
        }
        if state.closed {
            return false;
        }
        state.buf.push_back(item);
        self.items.notify_one();
        true
    }

    /// Take the oldest item, blocking while the queue is empty.
    /// `None` means the queue is closed and fully drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.buf.pop_front() {
                if self.limit != 0 {
                    self.space.notify_one();
                }
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.items.wait(&mut state);
        }
    }

    /// Non-blocking variant of [`pop`](Self::pop).
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        let item = state.buf.pop_front();
        if item.is_some() && self.limit != 0 {
            self.space.notify_one();
        }
        item
    }

    /// Close the queue and wake all waiters.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.items.notify_all();
        self.space.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().buf.is_empty()
    }
}
