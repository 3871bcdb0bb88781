use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex},
};

/// Lifecycle of a [`Bqueue`].
///
/// `DelayedDisable` refuses new pushes while letting the consumer drain
/// what is already queued; `Disabled` additionally means producers waiting
/// in `push` have been woken and told the queue is gone. Both states drain
/// on the pop side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueState {
    Enabled,
    Disabled,
    DelayedDisable,
}

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
    state: QueueState,
}

/// Bounded FIFO between two chain stages.
///
/// Push order per producer thread is preserved; interleaving between
/// producers is serialised but otherwise unspecified. The only suspension
/// points of a well-behaved stage are `push`, `pop` and its I/O calls, so
/// disabling a queue is guaranteed to unblock whoever sits on it.
pub struct Bqueue<T> {
    inner: Mutex<Inner<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<T> Bqueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
                state: QueueState::Enabled,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    pub fn state(&self) -> QueueState {
        self.inner.lock().unwrap().state
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().items.is_empty()
    }

    /// Enqueue `item`, blocking while the queue is full and enabled.
    /// Returns false when the queue no longer accepts pushes; the item is
    /// dropped and the producing stage treats that as end-of-stream.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        loop {
            match inner.state {
                QueueState::Disabled | QueueState::DelayedDisable => return false,
                QueueState::Enabled if inner.items.len() < inner.capacity => {
                    inner.items.push_back(item);
                    drop(inner);
                    self.not_empty.notify_one();
                    return true;
                }
                QueueState::Enabled => inner = self.not_full.wait(inner).unwrap(),
            }
        }
    }

    /// Nonblocking push: false when full or not enabled.
    pub fn try_push(&self, item: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != QueueState::Enabled || inner.items.len() >= inner.capacity {
            return false;
        }
        inner.items.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
        true
    }

    /// Dequeue the oldest item, blocking while the queue is empty and
    /// enabled. `None` means the queue is disabled *and* drained.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.items.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Some(item);
            }
            match inner.state {
                QueueState::Disabled | QueueState::DelayedDisable => return None,
                QueueState::Enabled => inner = self.not_empty.wait(inner).unwrap(),
            }
        }
    }

    /// Set a new capacity and return the queue to `Enabled`. Contents are
    /// preserved when they fit; otherwise the oldest items are discarded.
    pub fn resize_enable(&self, capacity: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.capacity = capacity.max(1);
        while inner.items.len() > inner.capacity {
            inner.items.pop_front();
        }
        inner.state = QueueState::Enabled;
        drop(inner);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Refuse all future pushes and wake every waiter. Queued items remain
    /// poppable until drained.
    pub fn disable(&self) {
        self.set_state(QueueState::Disabled);
    }

    /// Stop accepting pushes but let the consumer drain.
    pub fn delayed_disable(&self) {
        self.set_state(QueueState::DelayedDisable);
    }

    /// Drop everything still queued, then disable.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.items.clear();
        inner.state = QueueState::Disabled;
        drop(inner);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    fn set_state(&self, state: QueueState) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = state;
        drop(inner);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }
}
