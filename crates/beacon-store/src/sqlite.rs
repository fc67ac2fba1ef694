// ABOUTME: SQLite-backed durable LogStore so unsent records survive process restarts.
// ABOUTME: Rows hold the JSON record per group; batch pending state is tracked in memory only.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use beacon_core::{Log, LogBatch, LogStore, StoreError};
use chrono::Utc;
use rusqlite::{Connection, params};

use crate::pending::PendingBatches;

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

struct Inner {
    conn: Connection,
    pending: PendingBatches,
}

/// A durable store writing every record into a `logs` table.
pub struct SqliteLogStore {
    inner: Mutex<Inner>,
}

impl SqliteLogStore {
    /// Open or create a store database at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(backend)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(backend)?;
        Self::init(conn)
    }

    /// Open a private in-memory database. Nothing survives the process.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_name TEXT NOT NULL,
                log_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_logs_group ON logs (group_name, id);",
        )
        .map_err(backend)?;

        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                pending: PendingBatches::default(),
            }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl LogStore for SqliteLogStore {
    fn put(&self, group: &str, log: &Log) -> Result<i64, StoreError> {
        let payload = serde_json::to_string(log)?;
        let inner = self.lock()?;
        inner
            .conn
            .execute(
                "INSERT INTO logs (group_name, log_type, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![group, log.log_type, payload, Utc::now().to_rfc3339()],
            )
            .map_err(backend)?;
        Ok(inner.conn.last_insert_rowid())
    }

    fn get_logs(&self, group: &str, limit: usize) -> Result<Option<LogBatch>, StoreError> {
        let mut inner = self.lock()?;

        let rows: Vec<(i64, String)> = {
            let mut stmt = inner
                .conn
                .prepare("SELECT id, payload FROM logs WHERE group_name = ?1 ORDER BY id ASC")
                .map_err(backend)?;
            let mapped = stmt
                .query_map(params![group], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(backend)?;

            let mut rows = Vec::new();
            for row in mapped {
                let (id, payload): (i64, String) = row.map_err(backend)?;
                if inner.pending.is_pending(id) {
                    continue;
                }
                rows.push((id, payload));
                if rows.len() >= limit {
                    break;
                }
            }
            rows
        };

        let mut ids = Vec::new();
        let mut logs = Vec::new();
        for (id, payload) in rows {
            match serde_json::from_str::<Log>(&payload) {
                Ok(log) => {
                    ids.push(id);
                    logs.push(log);
                }
                Err(e) => {
                    tracing::warn!(group = %group, row_id = id, "dropping corrupted log row: {}", e);
                    inner
                        .conn
                        .execute("DELETE FROM logs WHERE id = ?1", params![id])
                        .map_err(backend)?;
                }
            }
        }

        if logs.is_empty() {
            return Ok(None);
        }

        let batch_id = inner.pending.register(group, ids);
        Ok(Some(LogBatch { batch_id, logs }))
    }

    fn delete_batch(&self, group: &str, batch_id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let Some(ids) = inner.pending.take(group, batch_id) else {
            tracing::debug!(group = %group, batch_id = %batch_id, "delete for unknown batch ignored");
            return Ok(());
        };

        let tx = inner.conn.unchecked_transaction().map_err(backend)?;
        for id in ids {
            tx.execute("DELETE FROM logs WHERE id = ?1", params![id])
                .map_err(backend)?;
        }
        tx.commit().map_err(backend)?;
        Ok(())
    }

    fn delete_group(&self, group: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.pending.forget_group(group);
        inner
            .conn
            .execute("DELETE FROM logs WHERE group_name = ?1", params![group])
            .map_err(backend)?;
        Ok(())
    }

    fn count(&self, group: &str) -> Result<usize, StoreError> {
        let inner = self.lock()?;
        let count: i64 = inner
            .conn
            .query_row(
                "SELECT COUNT(*) FROM logs WHERE group_name = ?1",
                params![group],
                |row| row.get(0),
            )
            .map_err(backend)?;
        Ok(count as usize)
    }

    fn clear_pending_state(&self) -> Result<(), StoreError> {
        self.lock()?.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn log(seq: usize) -> Log {
        Log::new("event").with_property("seq", seq)
    }

    #[test]
    fn sqlite_put_get_and_delete_batch() {
        let dir = TempDir::new().unwrap();
        let store = SqliteLogStore::open(&dir.path().join("logs.db")).unwrap();

        let written: Vec<Log> = (0..3).map(log).collect();
        for l in &written {
            store.put("events", l).unwrap();
        }

        let batch = store.get_logs("events", 2).unwrap().unwrap();
        assert_eq!(batch.logs, written[..2]);

        let rest = store.get_logs("events", 2).unwrap().unwrap();
        assert_eq!(rest.logs, written[2..]);

        store.delete_batch("events", &batch.batch_id).unwrap();
        assert_eq!(store.count("events").unwrap(), 1);
    }

    #[test]
    fn sqlite_rows_survive_reopen_but_pending_state_does_not() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs.db");

        {
            let store = SqliteLogStore::open(&path).unwrap();
            store.put("crashes", &log(1)).unwrap();
            store.put("crashes", &log(2)).unwrap();
            store.get_logs("crashes", 10).unwrap().unwrap();
        }

        let store = SqliteLogStore::open(&path).unwrap();
        assert_eq!(store.count("crashes").unwrap(), 2);
        let batch = store.get_logs("crashes", 10).unwrap().unwrap();
        assert_eq!(batch.logs.len(), 2, "rows pending before restart are readable again");
    }

    #[test]
    fn sqlite_corrupted_rows_are_dropped_on_read() {
        let store = SqliteLogStore::open_in_memory().unwrap();
        store.put("events", &log(1)).unwrap();
        {
            let inner = store.lock().unwrap();
            inner
                .conn
                .execute(
                    "INSERT INTO logs (group_name, log_type, payload, created_at)
                     VALUES ('events', 'event', 'not json', '')",
                    [],
                )
                .unwrap();
        }
        store.put("events", &log(2)).unwrap();

        let batch = store.get_logs("events", 10).unwrap().unwrap();
        assert_eq!(batch.logs.len(), 2);
        assert_eq!(store.count("events").unwrap(), 2, "corrupted row deleted");
    }

    #[test]
    fn sqlite_delete_group_and_clear_pending() {
        let store = SqliteLogStore::open_in_memory().unwrap();
        for i in 0..4 {
            store.put("events", &log(i)).unwrap();
        }
        store.put("other", &log(9)).unwrap();

        store.get_logs("events", 4).unwrap().unwrap();
        assert!(store.get_logs("events", 4).unwrap().is_none());
        store.clear_pending_state().unwrap();
        assert_eq!(store.get_logs("events", 4).unwrap().unwrap().logs.len(), 4);

        store.delete_group("events").unwrap();
        assert_eq!(store.count("events").unwrap(), 0);
        assert_eq!(store.count("other").unwrap(), 1);
    }

    #[test]
    fn sqlite_unknown_batch_delete_is_noop() {
        let store = SqliteLogStore::open_in_memory().unwrap();
        store.put("events", &log(0)).unwrap();
        store.delete_batch("events", "missing").unwrap();
        assert_eq!(store.count("events").unwrap(), 1);
    }
}
