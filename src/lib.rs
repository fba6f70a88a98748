//! An offline-first sync engine: local mutations are captured in a durable change log,
//! periodically pushed through a pluggable remote adapter, and reconciled against pulled remote
//! state through a configurable conflict resolver.

pub mod adapter;
pub mod changelog;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod first_load;
pub mod record;
pub mod resolver;
pub mod state;
pub mod store;

pub use adapter::{
    AddResult, AdapterError, BatchAdapter, FirstLoadBatch, PushAction, PushRequest, PushResult,
    RemoteAdapter, TableAdapter,
};
pub use changelog::{AckOutcome, ChangeLog, LogEntry, MemoryChangeLog, SqlChangeLog, StampedEntry};
pub use config::{Config, ConflictStrategy, LogLevel, MissingRemoteRecordStrategy};
pub use controller::{Status, SyncController, SyncState};
pub use error::{ApiError, SyncError};
pub use events::{EventBus, EventKind, MutationEvent, Subscription};
pub use first_load::{FirstLoadDriver, FirstLoadProgress, ProgressCallback};
pub use record::{LocalRecord, Payload, RemoteRecord};
pub use resolver::{Conflict, ResolveOutcome};
pub use state::{MemoryStateStore, PersistedState, SqlStateStore, StateStore};
pub use store::{Collection, Comparison, MemoryStore, SqliteStore, Store};
