//! The pending-change log: an append-only, per-table, per-`_localId` journal of outstanding
//! local mutations, with coalescing so that rapid local edits collapse into the one operation
//! that still needs to reach the server.

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::SyncError;
use crate::record::Payload;

/// One outstanding local mutation. Coalescing is pattern-matched over this sum type rather than
/// tracked as a status flag, so a record's net effect is always representable as exactly one
/// entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogEntry {
    Add { table: String, local_id: String, payload: Payload },
    Update {
        table: String,
        local_id: String,
        id: Option<serde_json::Value>,
        delta: Payload,
        base_snapshot: Payload,
    },
    Remove { table: String, local_id: String, id: serde_json::Value },
}

impl LogEntry {
    pub fn table(&self) -> &str {
        match self {
            LogEntry::Add { table, .. } => table,
            LogEntry::Update { table, .. } => table,
            LogEntry::Remove { table, .. } => table,
        }
    }

    pub fn local_id(&self) -> &str {
        match self {
            LogEntry::Add { local_id, .. } => local_id,
            LogEntry::Update { local_id, .. } => local_id,
            LogEntry::Remove { local_id, .. } => local_id,
        }
    }

    /// Whether this entry can be pushed over the wire as-is. An `update`/`remove` for a record
    /// that has never been assigned a remote `id` cannot be pushed; the controller must wait
    /// for the queued `add` to return one.
    pub fn is_push_ready(&self) -> bool {
        match self {
            LogEntry::Add { .. } => true,
            LogEntry::Update { id, .. } => id.is_some(),
            LogEntry::Remove { .. } => true, // remove always carries a concrete `id`
        }
    }
}

/// What the adapter reported after an entry was pushed. `id`/`updated_at` are only meaningful
/// for a successful `add`.
#[derive(Debug, Clone, Default)]
pub struct AckOutcome {
    pub id: Option<serde_json::Value>,
    pub updated_at: Option<i64>,
}

/// One stamped log entry as stored, carrying its assignment order.
#[derive(Debug, Clone)]
pub struct StampedEntry {
    pub seq: i64,
    pub entry: LogEntry,
}

/// Durable per-table journal of outstanding mutations.
pub trait ChangeLog: Send + Sync {
    /// Append `entry`, coalescing with any existing pending entry for the same table/`_localId`.
    /// Returns `Ok(None)` if coalescing dropped the entry entirely (`add → remove`).
    fn enqueue(&self, entry: LogEntry) -> Result<Option<i64>, SyncError>;

    /// The oldest push-ready entries, oldest first, up to `limit`.
    fn head(&self, limit: usize) -> Result<Vec<StampedEntry>, SyncError>;

    /// Remove the entry for `(table, local_id)` and, if `outcome` carries server fields, hand
    /// them back to the caller so they can be written onto the local record via the raw surface.
    fn ack(&self, table: &str, local_id: &str, outcome: AckOutcome) -> Result<(), SyncError>;

    /// Drop the entry for `(table, local_id)` without applying any outcome (used by the
    /// missing-record `ignore`/`delete-local-record` strategies).
    fn drop_entry(&self, table: &str, local_id: &str) -> Result<(), SyncError>;

    /// Overwrite the entry for `(table, local_id)` in place (used to rewrite a queued `update`
    /// into an `add` for the `insert-remote-record` missing-record strategy).
    fn replace(&self, table: &str, local_id: &str, entry: LogEntry) -> Result<(), SyncError>;

    /// The pending entry for `(table, local_id)`, if any — used by the controller's pull phase
    /// to tell whether an incoming remote record collides with an in-flight local edit.
    fn get_entry(&self, table: &str, local_id: &str) -> Result<Option<LogEntry>, SyncError>;

    fn length(&self) -> Result<usize, SyncError>;

    fn iter(&self) -> Result<Vec<StampedEntry>, SyncError>;
}

fn coalesce(existing: LogEntry, incoming: LogEntry) -> Result<Option<LogEntry>, SyncError> {
    use LogEntry::*;
    match (existing, incoming) {
        (Add { table, local_id, .. }, Add { payload, .. }) => {
            Ok(Some(Add { table, local_id, payload }))
        }
        (Add { payload, table, local_id }, Update { delta, .. }) => {
            let mut merged = payload;
            for (k, v) in delta {
                merged.insert(k, v);
            }
            Ok(Some(Add { table, local_id, payload: merged }))
        }
        (Add { .. }, Remove { .. }) => {
            // The record was never acknowledged by the server; there is nothing to delete
            // remotely. Dropped entirely rather than queued as a remote delete.
            Ok(None)
        }
        (
            Update { table, local_id, id, delta: old_delta, base_snapshot },
            Update { delta: new_delta, .. },
        ) => {
            let mut merged = old_delta;
            for (k, v) in new_delta {
                merged.insert(k, v);
            }
            Ok(Some(Update { table, local_id, id, delta: merged, base_snapshot }))
        }
        (Update { table, local_id, id, .. }, Remove { id: remove_id, .. }) => {
            let id = id.unwrap_or(remove_id);
            Ok(Some(Remove { table, local_id, id }))
        }
        (Remove { .. }, _) => Err(SyncError::State("remove is terminal; cannot coalesce further".into())),
        (existing, incoming) => {
            // Any other combination (e.g. Update -> Add) cannot occur via the sync-aware
            // surface, which only ever calls enqueue with Add on insert, Update on update,
            // Remove on delete; a record that already has an Update/Remove entry can't be
            // re-inserted without first being deleted.
            let _ = incoming;
            Ok(Some(existing))
        }
    }
}

/// SQLite-backed change log, materialized as a reserved table rather than a native queue. One
/// row per outstanding `(table_name, local_id)` pair.
pub struct SqlChangeLog {
    conn: Mutex<Connection>,
}

impl SqlChangeLog {
    pub fn new(conn: Connection) -> Result<Self, SyncError> {
        let log = Self { conn: Mutex::new(conn) };
        log.init_schema()?;
        Ok(log)
    }

    fn init_schema(&self) -> Result<(), SyncError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS _dync_changelog (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    local_id TEXT NOT NULL,
    entry_json TEXT NOT NULL,
    UNIQUE(table_name, local_id)
);
"#,
        )?;
        Ok(())
    }

    fn row_to_entry(raw: &str) -> Result<LogEntry, SyncError> {
        Ok(serde_json::from_str(raw)?)
    }
}

impl ChangeLog for SqlChangeLog {
    fn enqueue(&self, entry: LogEntry) -> Result<Option<i64>, SyncError> {
        let conn = self.conn.lock().unwrap();
        let table = entry.table().to_string();
        let local_id = entry.local_id().to_string();

        let existing_raw: Option<String> = conn
            .query_row(
                "SELECT entry_json FROM _dync_changelog WHERE table_name = ?1 AND local_id = ?2",
                params![table, local_id],
                |r| r.get(0),
            )
            .optional()?;

        let resolved = match existing_raw {
            Some(raw) => coalesce(Self::row_to_entry(&raw)?, entry)?,
            None => Some(entry),
        };

        match resolved {
            None => {
                conn.execute(
                    "DELETE FROM _dync_changelog WHERE table_name = ?1 AND local_id = ?2",
                    params![table, local_id],
                )?;
                Ok(None)
            }
            Some(final_entry) => {
                let json = serde_json::to_string(&final_entry)?;
                conn.execute(
                    "INSERT INTO _dync_changelog(table_name, local_id, entry_json)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(table_name, local_id) DO UPDATE SET entry_json = excluded.entry_json",
                    params![table, local_id, json],
                )?;
                let seq: i64 = conn.query_row(
                    "SELECT seq FROM _dync_changelog WHERE table_name = ?1 AND local_id = ?2",
                    params![table, local_id],
                    |r| r.get(0),
                )?;
                Ok(Some(seq))
            }
        }
    }

    fn head(&self, limit: usize) -> Result<Vec<StampedEntry>, SyncError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT seq, entry_json FROM _dync_changelog ORDER BY seq ASC")?;
        let rows = stmt.query_map([], |r| {
            let seq: i64 = r.get(0)?;
            let raw: String = r.get(1)?;
            Ok((seq, raw))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (seq, raw) = row?;
            let entry = Self::row_to_entry(&raw)?;
            if entry.is_push_ready() {
                out.push(StampedEntry { seq, entry });
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    fn ack(&self, table: &str, local_id: &str, _outcome: AckOutcome) -> Result<(), SyncError> {
        self.drop_entry(table, local_id)
    }

    fn drop_entry(&self, table: &str, local_id: &str) -> Result<(), SyncError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM _dync_changelog WHERE table_name = ?1 AND local_id = ?2",
            params![table, local_id],
        )?;
        Ok(())
    }

    fn replace(&self, table: &str, local_id: &str, entry: LogEntry) -> Result<(), SyncError> {
        let conn = self.conn.lock().unwrap();
        let json = serde_json::to_string(&entry)?;
        conn.execute(
            "UPDATE _dync_changelog SET entry_json = ?1 WHERE table_name = ?2 AND local_id = ?3",
            params![json, table, local_id],
        )?;
        Ok(())
    }

    fn get_entry(&self, table: &str, local_id: &str) -> Result<Option<LogEntry>, SyncError> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row(
                "SELECT entry_json FROM _dync_changelog WHERE table_name = ?1 AND local_id = ?2",
                params![table, local_id],
                |r| r.get(0),
            )
            .optional()?;
        raw.map(|r| Self::row_to_entry(&r)).transpose()
    }

    fn length(&self) -> Result<usize, SyncError> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM _dync_changelog", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    fn iter(&self) -> Result<Vec<StampedEntry>, SyncError> {
        self.head(usize::MAX)
    }
}

/// In-memory change log, used by `MemoryStore`-backed hosts and the test suite. Durable only
/// for the process lifetime.
#[derive(Default)]
pub struct MemoryChangeLog {
    inner: Mutex<MemoryChangeLogInner>,
}

#[derive(Default)]
struct MemoryChangeLogInner {
    next_seq: i64,
    // keyed by (table, local_id)
    entries: BTreeMap<(String, String), (i64, LogEntry)>,
}

impl MemoryChangeLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChangeLog for MemoryChangeLog {
    fn enqueue(&self, entry: LogEntry) -> Result<Option<i64>, SyncError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (entry.table().to_string(), entry.local_id().to_string());
        let resolved = match inner.entries.get(&key) {
            Some((_, existing)) => coalesce(existing.clone(), entry)?,
            None => Some(entry),
        };
        match resolved {
            None => {
                inner.entries.remove(&key);
                Ok(None)
            }
            Some(final_entry) => {
                inner.next_seq += 1;
                let seq = inner.next_seq;
                inner.entries.insert(key, (seq, final_entry));
                Ok(Some(seq))
            }
        }
    }

    fn head(&self, limit: usize) -> Result<Vec<StampedEntry>, SyncError> {
        let inner = self.inner.lock().unwrap();
        let mut all: Vec<_> = inner
            .entries
            .values()
            .filter(|(_, e)| e.is_push_ready())
            .map(|(seq, e)| StampedEntry { seq: *seq, entry: e.clone() })
            .collect();
        all.sort_by_key(|s| s.seq);
        all.truncate(limit);
        Ok(all)
    }

    fn ack(&self, table: &str, local_id: &str, _outcome: AckOutcome) -> Result<(), SyncError> {
        self.drop_entry(table, local_id)
    }

    fn drop_entry(&self, table: &str, local_id: &str) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.remove(&(table.to_string(), local_id.to_string()));
        Ok(())
    }

    fn replace(&self, table: &str, local_id: &str, entry: LogEntry) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (table.to_string(), local_id.to_string());
        let seq = inner.entries.get(&key).map(|(s, _)| *s).unwrap_or_else(|| {
            inner.next_seq += 1;
            inner.next_seq
        });
        inner.entries.insert(key, (seq, entry));
        Ok(())
    }

    fn get_entry(&self, table: &str, local_id: &str) -> Result<Option<LogEntry>, SyncError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.entries.get(&(table.to_string(), local_id.to_string())).map(|(_, e)| e.clone()))
    }

    fn length(&self) -> Result<usize, SyncError> {
        Ok(self.inner.lock().unwrap().entries.len())
    }

    fn iter(&self) -> Result<Vec<StampedEntry>, SyncError> {
        self.head(usize::MAX)
    }
}
