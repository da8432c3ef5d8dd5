//! Cross-cutting storage-failure budget shared by every component backed by
//! the Storage Engine (Message Log, Command Tracker, Event Processor). Each
//! reports its own failures here rather than the runtime polling them; once
//! `budget` consecutive failures land without an intervening success, a
//! shutdown reason is sent once so the runtime can stop and let an operator
//! intervene instead of spinning on a wedged store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::error;

#[derive(Clone)]
pub struct StorageFailureMonitor {
    count: Arc<AtomicU32>,
    budget: u32,
    trip_tx: mpsc::Sender<String>,
}

impl StorageFailureMonitor {
    /// Returns the monitor plus the receiving half of its trip channel; the
    /// caller awaits the latter to learn when the budget has been exceeded.
    pub fn new(budget: u32) -> (Self, mpsc::Receiver<String>) {
        let (trip_tx, trip_rx) = mpsc::channel(1);
        (
            StorageFailureMonitor {
                count: Arc::new(AtomicU32::new(0)),
                budget,
                trip_tx,
            },
            trip_rx,
        )
    }

    /// A monitor with no receiver listening; failures are still counted but
    /// never observed. Used where a caller has no shutdown path to wire up.
    pub fn disabled() -> Self {
        Self::new(u32::MAX).0
    }

    pub fn note_failure(&self, context: &str) {
        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        error!(context, count, budget = self.budget, "storage operation failed");
        if count >= self.budget {
            let _ = self.trip_tx.try_send(format!("storage failure budget exceeded in {context}"));
        }
    }

    /// Call after a successful storage operation; a failure budget counts
    /// consecutive failures, so any success clears the streak.
    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
    }
}
