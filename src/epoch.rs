//! The injected epoch source (`spec.md` §9, "Event-loop epoch tracking").
//!
//! The original source binds an ephemeral reader's lifetime to the tick of
//! whatever event loop it runs on. Rather than depend on any particular
//! event-loop implementation, the multi-version wrapper takes an
//! `EpochSource` and asks it for the lowest tick every worker has reached;
//! ephemeral readers retired before that tick can have their chunks
//! released.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub trait EpochSource: Send + Sync {
    /// A monotonically increasing counter for the whole loop.
    fn current(&self) -> u64;

    /// The last tick worker `worker` is known to have published. Workers
    /// that have never published return 0.
    fn per_worker_current(&self, worker: usize) -> u64;
}

/// A manually driven epoch source for tests and for embedders without an
/// event loop of their own: nothing advances automatically, the caller
/// calls `advance`/`publish_worker` directly.
pub struct ManualEpoch {
    tick: AtomicU64,
    workers: Mutex<Vec<u64>>,
}

impl ManualEpoch {
    pub fn new(worker_count: usize) -> Self {
        ManualEpoch {
            tick: AtomicU64::new(0),
            workers: Mutex::new(vec![0; worker_count]),
        }
    }

    /// Advances the global tick and returns the new value.
    pub fn advance(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Publishes that `worker` has reached `tick` (never moves backwards).
    pub fn publish_worker(&self, worker: usize, tick: u64) {
        let mut workers = self.workers.lock().unwrap();
        if worker >= workers.len() {
            workers.resize(worker + 1, 0);
        }
        if workers[worker] < tick {
            workers[worker] = tick;
        }
    }
}

impl EpochSource for ManualEpoch {
    fn current(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }

    fn per_worker_current(&self, worker: usize) -> u64 {
        let workers = self.workers.lock().unwrap();
        workers.get(worker).copied().unwrap_or(0)
    }
}
