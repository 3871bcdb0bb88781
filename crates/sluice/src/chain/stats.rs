use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

/// Per-step byte counters of one chain.
///
/// Counters are bumped by the stage threads with relaxed stores and read by
/// the control thread while the chain runs; these are statistics, not
/// control flow, so nobody synchronises on them.
#[derive(Default)]
pub struct ChainStats {
    entries: Mutex<Vec<StatEntry>>,
}

struct StatEntry {
    name: String,
    counter: Arc<AtomicU64>,
}

impl ChainStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, name: &str) -> Arc<AtomicU64> {
        let counter = Arc::new(AtomicU64::new(0));
        self.entries
            .lock()
            .unwrap()
            .push(StatEntry { name: name.to_string(), counter: Arc::clone(&counter) });
        counter
    }

    /// `(step name, bytes so far)` in chain order.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|e| (e.name.clone(), e.counter.load(Ordering::Relaxed)))
            .collect()
    }
}
