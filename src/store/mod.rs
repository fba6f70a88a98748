//! The `Store` capability: the minimal read/write contract the engine requires of a
//! local record store. This crate ships two implementations behind the same trait object —
//! `SqliteStore` (the embedded SQL engine back-end) and `MemoryStore` (in-process, for tests and
//! hosts that don't need durability) — so the controller itself never knows which one it's
//! talking to.
//!
//! `Collection`, the result of `Store::where_field`, is an eagerly evaluated stand-in rather than
//! a lazy cursor, which is sufficient for everything the controller and first-load driver need
//! from it.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::SyncError;
use crate::record::LocalRecord;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Comparison<'a> {
    Equals(&'a serde_json::Value),
    Above(&'a serde_json::Value),
    Below(&'a serde_json::Value),
}

/// An eagerly-materialized result set from `Store::where_field`. This type itself is a plain
/// value bag with no sync awareness; bulk `modify`/`delete` over a matching set is exposed on
/// `SyncController` (`modify_matching`/`delete_matching`), which re-runs the same `where_field`
/// query and routes each matched record through the controller's own `update`/`delete` so the
/// change log and event bus observe every mutation.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    pub(crate) rows: Vec<LocalRecord>,
}

impl Collection {
    pub fn to_vec(&self) -> Vec<LocalRecord> {
        self.rows.clone()
    }

    pub fn count(&self) -> usize {
        self.rows.len()
    }

    pub fn first(&self) -> Option<&LocalRecord> {
        self.rows.first()
    }

    pub fn last(&self) -> Option<&LocalRecord> {
        self.rows.last()
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.rows.truncate(n);
        self
    }

    pub fn offset(mut self, n: usize) -> Self {
        self.rows = self.rows.into_iter().skip(n).collect();
        self
    }

    pub fn reverse(mut self) -> Self {
        self.rows.reverse();
        self
    }

    pub fn sort_by(mut self, mut key: impl FnMut(&LocalRecord) -> String) -> Self {
        self.rows.sort_by_key(|r| key(r));
        self
    }

    pub fn filter(mut self, pred: impl Fn(&LocalRecord) -> bool) -> Self {
        self.rows.retain(|r| pred(r));
        self
    }
}

/// Minimal read/write contract the engine requires of a local record store. Both the
/// sync-aware table surface and the engine's own `raw` operations (used when hydrating pulled
/// data) are expressed in terms of this trait; only the sync-aware surface also touches the
/// change log and event bus (that glue lives in `crate::controller`, not here).
pub trait Store: Send + Sync {
    fn add(&self, table: &str, record: &LocalRecord) -> Result<(), SyncError>;
    fn put(&self, table: &str, record: &LocalRecord) -> Result<(), SyncError>;
    fn update(&self, table: &str, local_id: &str, delta: &crate::record::Payload) -> Result<(), SyncError>;
    fn delete(&self, table: &str, local_id: &str) -> Result<(), SyncError>;
    fn get(&self, table: &str, local_id: &str) -> Result<Option<LocalRecord>, SyncError>;

    fn bulk_add(&self, table: &str, records: &[LocalRecord]) -> Result<(), SyncError> {
        for r in records {
            self.add(table, r)?;
        }
        Ok(())
    }

    fn bulk_put(&self, table: &str, records: &[LocalRecord]) -> Result<(), SyncError> {
        for r in records {
            self.put(table, r)?;
        }
        Ok(())
    }

    fn bulk_update(&self, table: &str, updates: &[(String, crate::record::Payload)]) -> Result<(), SyncError> {
        for (local_id, delta) in updates {
            self.update(table, local_id, delta)?;
        }
        Ok(())
    }

    fn bulk_delete(&self, table: &str, local_ids: &[String]) -> Result<(), SyncError> {
        for id in local_ids {
            self.delete(table, id)?;
        }
        Ok(())
    }

    /// Secondary-index lookup. `field` names a payload field; `id` (when present) resolves the
    /// local record owning that remote `id`, used by the pull path to map remote `id` back to
    /// an existing `_localId` during per-cycle reconciliation.
    fn where_field(&self, table: &str, field: &str, cmp: Comparison<'_>) -> Result<Collection, SyncError>;

    fn find_by_remote_id(&self, table: &str, id: &serde_json::Value) -> Result<Option<LocalRecord>, SyncError>;

    fn all(&self, table: &str) -> Result<Vec<LocalRecord>, SyncError>;
}
