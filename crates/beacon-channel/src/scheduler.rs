// ABOUTME: Delayed task scheduling used for per-group flush timers.
// ABOUTME: TokioScheduler spawns a sleeping task per timer and aborts it on cancel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs a task once after a delay unless cancelled first.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerId;

    /// Cancelling an unknown or already fired timer is a no-op.
    fn cancel(&self, id: TimerId);
}

/// Scheduler backed by the tokio timer wheel. Must be used inside a runtime.
#[derive(Default)]
pub struct TokioScheduler {
    next_id: AtomicU64,
    timers: Arc<Mutex<HashMap<TimerId, JoinHandle<()>>>>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_timers(&self) -> usize {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let timers = Arc::clone(&self.timers);

        let mut guard = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        // The task cannot remove itself before it is inserted: it needs this lock.
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            timers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            task();
        });
        guard.insert(id, handle);
        id
    }

    fn cancel(&self, id: TimerId) {
        let handle = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}
