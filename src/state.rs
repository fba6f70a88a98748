//! Persisted state: cursors, last-pulled timestamps, and first-load progress, held in
//! one reserved row so a restart resumes exactly where the engine left off.

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::SyncError;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PersistedState {
    pub first_load_done: HashMap<String, bool>,
    pub last_pulled: HashMap<String, i64>,
    pub first_load_cursor: HashMap<String, Option<String>>,
}

impl PersistedState {
    pub fn is_first_load_done(&self, table: &str) -> bool {
        self.first_load_done.get(table).copied().unwrap_or(false)
    }

    pub fn last_pulled(&self, table: &str) -> i64 {
        self.last_pulled.get(table).copied().unwrap_or(0)
    }

    /// `lastPulled[table]` never decreases.
    pub fn advance_last_pulled(&mut self, table: &str, candidate: i64) {
        let slot = self.last_pulled.entry(table.to_string()).or_insert(0);
        if candidate > *slot {
            *slot = candidate;
        }
    }

    pub fn mark_first_load_done(&mut self, table: &str) {
        self.first_load_done.insert(table.to_string(), true);
    }

    /// Treat first-load as skipped for every table in `tables`: done is set true, `lastPulled`
    /// stays unset (reads as epoch on the next cycle).
    pub fn mark_first_load_skipped(&mut self, tables: &[String]) {
        for t in tables {
            self.first_load_done.insert(t.clone(), true);
        }
    }
}

pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<PersistedState, SyncError>;
    fn save(&self, state: &PersistedState) -> Result<(), SyncError>;
}

/// SQLite-backed persisted state: one reserved table `_dync_state`, one row.
pub struct SqlStateStore {
    conn: Mutex<Connection>,
}

impl SqlStateStore {
    pub fn new(conn: Connection) -> Result<Self, SyncError> {
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), SyncError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _dync_state (
                _local_id TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(())
    }
}

impl StateStore for SqlStateStore {
    fn load(&self) -> Result<PersistedState, SyncError> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM _dync_state WHERE _local_id = 'sync_state'",
                [],
                |r| r.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(PersistedState::default()),
        }
    }

    fn save(&self, state: &PersistedState) -> Result<(), SyncError> {
        let conn = self.conn.lock().unwrap();
        let json = serde_json::to_string(state)?;
        conn.execute(
            "INSERT INTO _dync_state(_local_id, value) VALUES ('sync_state', ?1)
             ON CONFLICT(_local_id) DO UPDATE SET value = excluded.value",
            params![json],
        )?;
        Ok(())
    }
}

/// In-memory persisted state, process-lifetime only (paired with `MemoryStore`/`MemoryChangeLog`).
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<PersistedState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<PersistedState, SyncError> {
        Ok(self.inner.lock().unwrap().clone())
    }

    fn save(&self, state: &PersistedState) -> Result<(), SyncError> {
        *self.inner.lock().unwrap() = state.clone();
        Ok(())
    }
}
