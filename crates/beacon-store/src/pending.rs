// ABOUTME: In-memory bookkeeping of batches handed out by a store but not yet acknowledged.
// ABOUTME: Shared by the memory and SQLite stores; pending state never survives a restart.

use std::collections::{HashMap, HashSet};

use ulid::Ulid;

#[derive(Debug, Default)]
pub(crate) struct PendingBatches {
    batches: HashMap<String, (String, Vec<i64>)>,
    row_ids: HashSet<i64>,
}

impl PendingBatches {
    pub(crate) fn is_pending(&self, row_id: i64) -> bool {
        self.row_ids.contains(&row_id)
    }

    /// Mark rows as pending under a fresh batch id.
    pub(crate) fn register(&mut self, group: &str, row_ids: Vec<i64>) -> String {
        let batch_id = Ulid::new().to_string();
        self.row_ids.extend(row_ids.iter().copied());
        self.batches
            .insert(batch_id.clone(), (group.to_string(), row_ids));
        batch_id
    }

    /// Remove a batch and return its row ids if it belongs to `group`.
    pub(crate) fn take(&mut self, group: &str, batch_id: &str) -> Option<Vec<i64>> {
        match self.batches.get(batch_id) {
            Some((owner, _)) if owner == group => {}
            _ => return None,
        }
        let (_, rows) = self.batches.remove(batch_id)?;
        for id in &rows {
            self.row_ids.remove(id);
        }
        Some(rows)
    }

    pub(crate) fn forget_group(&mut self, group: &str) {
        let ids: Vec<String> = self
            .batches
            .iter()
            .filter(|(_, (owner, _))| owner == group)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            let _ = self.take(group, &id);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.batches.clear();
        self.row_ids.clear();
    }
}
