//! The first-load driver: cursor-paged bulk ingestion that must complete, per table, once
//! before periodic sync is allowed to pull that table at all.

use std::collections::HashMap;

use crate::adapter::{AdapterError, RemoteAdapter};
use crate::error::SyncError;
use crate::record::{derive_local_id, project_inbound};
use crate::state::{PersistedState, StateStore};
use crate::store::Store;

/// Progress reported to the host's optional callback as pages land.
#[derive(Debug, Clone)]
pub struct FirstLoadProgress {
    pub table: String,
    pub received: usize,
    pub cursor: Option<String>,
}

pub type ProgressCallback<'a> = dyn FnMut(FirstLoadProgress) + 'a;

/// Drives `firstLoad` to completion for every synced table that hasn't finished yet, inserting
/// each page via the raw surface (no change-log entries) and persisting state at every batch
/// boundary so a crash mid-load resumes from the last completed page rather than restarting.
pub struct FirstLoadDriver<'a> {
    pub store: &'a dyn Store,
    pub state_store: &'a dyn StateStore,
    pub adapter: &'a RemoteAdapter,
    pub tables: &'a [String],
}

impl<'a> FirstLoadDriver<'a> {
    pub fn run(&self, mut progress: Option<&mut ProgressCallback<'_>>) -> Result<(), SyncError> {
        let mut state = self.state_store.load()?;

        match self.adapter {
            RemoteAdapter::PerTable(adapters) => {
                for table in self.tables {
                    if state.is_first_load_done(table) {
                        continue;
                    }
                    let Some(table_adapter) = adapters.get(table) else {
                        return Err(SyncError::Programmer("missing adapter for synced table"));
                    };

                    let mut cursor = state.first_load_cursor.get(table).cloned().flatten();
                    loop {
                        let page = table_adapter.first_load(cursor.as_deref()).map_err(adapter_err)?;
                        let Some(page) = page else {
                            // This table doesn't support first-load; treat as immediately done.
                            state.mark_first_load_done(table);
                            break;
                        };
                        if page.is_empty() {
                            state.mark_first_load_done(table);
                            self.state_store.save(&state)?;
                            break;
                        }

                        let mut last_id_str = None;
                        for remote in page.iter() {
                            let local_id = derive_local_id(table, &remote.id);
                            let local = project_inbound(remote, local_id);
                            self.store.put(table, &local)?;
                            state.advance_last_pulled(table, remote.updated_at);
                            last_id_str = Some(remote.id.to_string());
                        }
                        cursor = last_id_str;
                        state.first_load_cursor.insert(table.clone(), cursor.clone());
                        self.state_store.save(&state)?;

                        if let Some(cb) = progress.as_deref_mut() {
                            cb(FirstLoadProgress { table: table.clone(), received: page.len(), cursor: cursor.clone() });
                        }
                    }
                }
            }
            RemoteAdapter::Batch(adapter) => {
                let remaining: Vec<String> =
                    self.tables.iter().filter(|t| !state.is_first_load_done(t)).cloned().collect();
                if remaining.is_empty() {
                    return Ok(());
                }

                let mut cursors: HashMap<String, Option<String>> =
                    remaining.iter().map(|t| (t.clone(), state.first_load_cursor.get(t).cloned().flatten())).collect();

                loop {
                    let batch = adapter.first_load(&cursors).map_err(adapter_err)?;
                    let mut any_rows = false;
                    for (table, rows) in batch.data.iter() {
                        any_rows |= !rows.is_empty();
                        for remote in rows.iter() {
                            let local_id = derive_local_id(table, &remote.id);
                            let local = project_inbound(remote, local_id);
                            self.store.put(table, &local)?;
                            state.advance_last_pulled(table, remote.updated_at);
                        }
                        if let Some(cb) = progress.as_deref_mut() {
                            cb(FirstLoadProgress {
                                table: table.clone(),
                                received: rows.len(),
                                cursor: batch.cursors.get(table).cloned().flatten(),
                            });
                        }
                    }

                    cursors = batch.cursors.clone();
                    for (table, cursor) in batch.cursors.iter() {
                        state.first_load_cursor.insert(table.clone(), cursor.clone());
                    }
                    self.state_store.save(&state)?;

                    if !batch.has_more {
                        for table in &remaining {
                            state.mark_first_load_done(table);
                        }
                        self.state_store.save(&state)?;
                        break;
                    }
                    if !any_rows {
                        // Defensive: a well-behaved server sets has_more=false once exhausted;
                        // bail out rather than spin forever if it doesn't.
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Equivalent to marking every synced table's first load as done without ever calling the
    /// adapter: `lastPulled` stays unset, which the controller reads as "pull everything since
    /// epoch" on the next cycle.
    pub fn skip(tables: &[String], state: &mut PersistedState) {
        state.mark_first_load_skipped(tables);
    }
}

fn adapter_err(e: AdapterError) -> SyncError {
    match e {
        AdapterError::Network(m) => SyncError::State(format!("network: {m}")),
        AdapterError::Rejected(m) => SyncError::Config(format!("server rejected first-load: {m}")),
        AdapterError::NotFound => SyncError::State("unexpected not-found during first-load".into()),
    }
}
