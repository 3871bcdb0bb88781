use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::{Block, Bqueue};

/// Registry of queues that receive copies of one pipeline's output, so a
/// second chain can snoop the stream while the main transfer runs.
///
/// Owned by the runtime and handed to the stages that need it; there is no
/// hidden global. Registration and removal are rare, so the registry lock
/// is simply held across the pushes.
#[derive(Default)]
pub struct BroadcastHub {
    queues: Mutex<Vec<Arc<Bqueue<Block>>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a fresh queue; the handle doubles as the pop
    /// endpoint for the snooping chain.
    pub fn add_queue(&self, capacity: usize) -> Arc<Bqueue<Block>> {
        let q = Arc::new(Bqueue::new(capacity));
        self.queues.lock().unwrap().push(Arc::clone(&q));
        debug!(capacity, "interchain queue registered");
        q
    }

    /// Unregister (by identity) and disable the queue so its reader drains
    /// out.
    pub fn remove_queue(&self, q: &Arc<Bqueue<Block>>) {
        let mut queues = self.queues.lock().unwrap();
        queues.retain(|r| !Arc::ptr_eq(r, q));
        drop(queues);
        q.disable();
        debug!("interchain queue removed");
    }

    pub fn queue_count(&self) -> usize {
        self.queues.lock().unwrap().len()
    }

    /// Blocking push of a copy to every registered queue; true iff every
    /// push was accepted.
    pub fn push_all(&self, b: &Block) -> bool {
        let queues = self.queues.lock().unwrap();
        let mut all = true;
        for q in queues.iter() {
            all &= q.push(b.clone());
        }
        all
    }

    /// Nonblocking push: a full or non-enabled queue just misses this
    /// block. Used on the main data path, where a slow snooper must never
    /// stall the transfer.
    pub fn try_push_all(&self, b: &Block) {
        let queues = self.queues.lock().unwrap();
        for q in queues.iter() {
            q.try_push(b.clone());
        }
    }

    /// Teardown: refuse further data on every registered queue.
    pub fn disable_all(&self) {
        for q in self.queues.lock().unwrap().iter() {
            q.disable();
        }
    }

    /// Re-arm every registered queue for a new transfer.
    pub fn resize_enable_all(&self, capacity: usize) {
        for q in self.queues.lock().unwrap().iter() {
            q.resize_enable(capacity);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn push_all_reaches_every_queue() {
        let hub = BroadcastHub::new();
        let a = hub.add_queue(4);
        let b = hub.add_queue(4);

        assert!(hub.push_all(&Block::from_vec(vec![1, 2, 3])));
        assert_eq!(a.pop().unwrap().as_slice(), &[1, 2, 3]);
        assert_eq!(b.pop().unwrap().as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn try_push_drops_on_full_queue() {
        let hub = BroadcastHub::new();
        let small = hub.add_queue(1);
        let big = hub.add_queue(4);

        hub.try_push_all(&Block::from_vec(vec![1]));
        hub.try_push_all(&Block::from_vec(vec![2]));

        assert_eq!(small.pop().unwrap().as_slice(), &[1]);
        assert_eq!(big.pop().unwrap().as_slice(), &[1]);
        assert_eq!(big.pop().unwrap().as_slice(), &[2]);
        assert_eq!(small.len(), 0);
    }

    #[test]
    fn removal_disables_only_that_queue() {
        let hub = BroadcastHub::new();
        let gone = hub.add_queue(2);
        let kept = hub.add_queue(2);

        hub.remove_queue(&gone);
        assert_eq!(hub.queue_count(), 1);
        assert!(gone.pop().is_none());

        assert!(hub.push_all(&Block::from_vec(vec![9])));
        assert_eq!(kept.pop().unwrap().as_slice(), &[9]);
    }
}
