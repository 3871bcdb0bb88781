use std::{collections::VecDeque, sync::Mutex};

use chrono::{DateTime, Utc};
use tracing::debug;

/// Oldest spooled errors get dropped beyond this many distinct entries.
const SPOOL_CAP: usize = 32;

/// One spooled failure. A repeat of the same `(code, message)` back to back
/// does not grow the spool; it bumps `occurrences` and `last`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpooledError {
    pub code: u32,
    pub message: String,
    pub first: DateTime<Utc>,
    pub last: DateTime<Utc>,
    pub occurrences: u64,
}

/// Ring of recent failures, surfaced one at a time through the `error?`
/// query. Stage failures land here; errors made inside a command handler
/// do not, they go straight into the reply.
#[derive(Default)]
pub struct ErrorSpool {
    ring: Mutex<VecDeque<SpooledError>>,
}

impl ErrorSpool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, code: u32, message: &str) {
        let now = Utc::now();
        let mut ring = self.ring.lock().unwrap();
        if let Some(tail) = ring.back_mut() {
            if tail.code == code && tail.message == message {
                tail.occurrences += 1;
                tail.last = now;
                return;
            }
        }
        if ring.len() == SPOOL_CAP {
            ring.pop_front();
        }
        debug!(code, message, "error spooled");
        ring.push_back(SpooledError {
            code,
            message: message.to_string(),
            first: now,
            last: now,
            occurrences: 1,
        });
    }

    /// Surface the oldest entry and remove it.
    pub fn pop(&self) -> Option<SpooledError> {
        self.ring.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().unwrap().is_empty()
    }
}
