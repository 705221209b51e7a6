use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::THREAD_MAX;

/// A count of playback workers shared between macros.
///
/// Hand the same `Arc<WorkerBudget>` to several macros to cap their combined
/// worker threads.
#[derive(Debug)]
pub struct WorkerBudget {
    limit: usize,
    active: AtomicUsize,
}

impl WorkerBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            active: AtomicUsize::new(0),
        }
    }

    /// Take a worker slot if one is free
    pub fn try_acquire(self: &Arc<Self>) -> Option<Permit> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < self.limit).then_some(active + 1)
            })
            .ok()
            .map(|_| Permit {
                budget: self.clone(),
            })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Workers currently holding a slot
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

impl Default for WorkerBudget {
    fn default() -> Self {
        Self::new(THREAD_MAX)
    }
}

/// A held worker slot, released on drop
#[derive(Debug)]
pub struct Permit {
    budget: Arc<WorkerBudget>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.budget.active.fetch_sub(1, Ordering::AcqRel);
    }
}
