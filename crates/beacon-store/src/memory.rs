// ABOUTME: Volatile LogStore implementation backed by an ordered map behind a mutex.
// ABOUTME: Used for tests and hosts that accept losing unsent records on restart.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use beacon_core::{Log, LogBatch, LogStore, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<i64, (String, Log)>,
    next_id: i64,
    pending: crate::pending::PendingBatches,
}

/// An in-memory store. Row ids grow monotonically so reads are oldest first.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    state: Mutex<MemoryState>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl LogStore for MemoryLogStore {
    fn put(&self, group: &str, log: &Log) -> Result<i64, StoreError> {
        let mut state = self.lock()?;
        state.next_id += 1;
        let id = state.next_id;
        state.rows.insert(id, (group.to_string(), log.clone()));
        Ok(id)
    }

    fn get_logs(&self, group: &str, limit: usize) -> Result<Option<LogBatch>, StoreError> {
        let mut state = self.lock()?;
        let mut ids = Vec::new();
        let mut logs = Vec::new();
        for (id, (owner, log)) in &state.rows {
            if logs.len() >= limit {
                break;
            }
            if owner == group && !state.pending.is_pending(*id) {
                ids.push(*id);
                logs.push(log.clone());
            }
        }

        if logs.is_empty() {
            return Ok(None);
        }

        let batch_id = state.pending.register(group, ids);
        Ok(Some(LogBatch { batch_id, logs }))
    }

    fn delete_batch(&self, group: &str, batch_id: &str) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if let Some(ids) = state.pending.take(group, batch_id) {
            for id in ids {
                state.rows.remove(&id);
            }
        }
        Ok(())
    }

    fn delete_group(&self, group: &str) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.pending.forget_group(group);
        state.rows.retain(|_, (owner, _)| owner != group);
        Ok(())
    }

    fn count(&self, group: &str) -> Result<usize, StoreError> {
        let state = self.lock()?;
        Ok(state.rows.values().filter(|(owner, _)| owner == group).count())
    }

    fn clear_pending_state(&self) -> Result<(), StoreError> {
        self.lock()?.pending.clear();
        Ok(())
    }
}
