//! The remote adapter: normalizes two wire styles — per-table CRUD and coalesced batch —
//! behind one interface the controller drives. The mode is chosen at construction and is
//! immutable for the life of the `RemoteAdapter`.

use std::collections::HashMap;

use crate::record::{Payload, RemoteRecord};

#[derive(Debug, Clone, PartialEq)]
pub enum AdapterError {
    /// Offline/unreachable, timeouts, DNS failures — anything the adapter can tell apart from
    /// a server-side rejection. Surfaces as `ApiError::is_network_error = true`.
    Network(String),
    /// The server rejected the call for a reason other than "record missing" (validation,
    /// auth, 5xx, ...). The log entry stays queued; retried on the next cycle.
    Rejected(String),
    /// A definite "not found" on `update`. Never surfaced as `apiError`.
    NotFound,
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterError::Network(m) => write!(f, "network error: {m}"),
            AdapterError::Rejected(m) => write!(f, "server rejected: {m}"),
            AdapterError::NotFound => write!(f, "record not found"),
        }
    }
}

/// Result of pushing one `add`.
pub struct AddResult {
    pub id: serde_json::Value,
    pub updated_at: i64,
}

/// Per-table CRUD adapter surface: one `add`/`update`/`remove`/`list` per synced table.
pub trait TableAdapter: Send + Sync {
    fn add(&self, local: &Payload) -> Result<AddResult, AdapterError>;

    /// `Ok(true)`: updated. `Ok(false)`: no such remote record (see the missing-record strategy).
    fn update(&self, id: &serde_json::Value, delta: &Payload, full: &Payload) -> Result<bool, AdapterError>;

    fn remove(&self, id: &serde_json::Value) -> Result<(), AdapterError>;

    /// Must include tombstones (`deleted = true`); comparison against `since` is strict `>`.
    fn list(&self, since: i64) -> Result<Vec<RemoteRecord>, AdapterError>;

    /// One page of the bulk first-load feed. `None` means this table doesn't support first-load
    /// (periodic sync pulls from epoch instead).
    fn first_load(&self, _cursor: Option<&str>) -> Result<Option<Vec<RemoteRecord>>, AdapterError> {
        Ok(None)
    }

    /// Minimum wall-clock time between successive `list` calls for this table, in milliseconds.
    fn list_extra_interval_ms(&self) -> Option<u64> {
        None
    }
}

/// What one batch `push` entry asks the server to do.
#[derive(Debug, Clone)]
pub enum PushAction {
    Add { data: Payload },
    Update { id: serde_json::Value, data: Payload },
    Remove { id: serde_json::Value },
}

#[derive(Debug, Clone)]
pub struct PushRequest {
    pub table: String,
    pub local_id: String,
    pub action: PushAction,
}

#[derive(Debug, Clone)]
pub struct PushResult {
    pub local_id: String,
    pub success: bool,
    pub id: Option<serde_json::Value>,
    pub updated_at: Option<i64>,
    pub not_found: bool,
    pub error: Option<String>,
}

pub struct FirstLoadBatch {
    pub data: HashMap<String, Vec<RemoteRecord>>,
    pub cursors: HashMap<String, Option<String>>,
    pub has_more: bool,
}

/// Coalesced batch adapter surface: one endpoint group drives every synced table.
pub trait BatchAdapter: Send + Sync {
    fn push(&self, entries: &[PushRequest]) -> Result<Vec<PushResult>, AdapterError>;

    fn pull(&self, since: &HashMap<String, i64>) -> Result<HashMap<String, Vec<RemoteRecord>>, AdapterError>;

    fn first_load(&self, cursors: &HashMap<String, Option<String>>) -> Result<FirstLoadBatch, AdapterError>;
}

/// The adapter mode, fixed at construction. `listExtraIntervalMs` exists only on the
/// per-table mode; batch mode always pulls unconditionally.
pub enum RemoteAdapter {
    PerTable(HashMap<String, Box<dyn TableAdapter>>),
    Batch(Box<dyn BatchAdapter>),
}

impl RemoteAdapter {
    pub fn per_table(tables: HashMap<String, Box<dyn TableAdapter>>) -> Self {
        RemoteAdapter::PerTable(tables)
    }

    pub fn batch(adapter: Box<dyn BatchAdapter>) -> Self {
        RemoteAdapter::Batch(adapter)
    }

    pub fn table_names(&self) -> Vec<String> {
        match self {
            RemoteAdapter::PerTable(tables) => tables.keys().cloned().collect(),
            RemoteAdapter::Batch(_) => Vec::new(),
        }
    }
}
