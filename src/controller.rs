//! The sync controller: the state machine, scheduler, and push/pull cycle algorithm that
//! the rest of the crate exists to serve. Drives the full multi-table, multi-mode,
//! multi-strategy sync cycle end to end, including the scheduling, cancellation, and overlap
//! suppression machinery a host would otherwise have to provide itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::adapter::{AdapterError, PushAction, PushRequest, RemoteAdapter};
use crate::changelog::{AckOutcome, ChangeLog, LogEntry};
use crate::config::{Config, LogLevel, MissingRemoteRecordStrategy};
use crate::error::{ApiError, SyncError};
use crate::events::{EventBus, EventKind, MutationEvent, Subscription};
use crate::first_load::{FirstLoadDriver, ProgressCallback};
use crate::record::{derive_local_id, merge_inbound_into, project_inbound, project_outbound, LocalRecord, Payload, RemoteRecord};
use crate::resolver::{self, Conflict, ResolveOutcome};
use crate::state::StateStore;
use crate::store::{Comparison, Store};

/// How many change-log entries one cycle pushes at most. Not a recognized config key; an
/// internal batching knob only.
const PUSH_BATCH_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Disabled,
    Idle,
    Syncing,
    FirstLoading,
}

/// A point-in-time snapshot of everything the host API exposes.
#[derive(Debug, Clone)]
pub struct SyncState {
    pub status: Status,
    pub first_load_done: HashMap<String, bool>,
    pub last_pulled: HashMap<String, i64>,
    pub pending_changes: usize,
    pub conflicts: Vec<Conflict>,
    pub api_error: Option<ApiError>,
}

struct Inner {
    status: Status,
    /// Bumped every time a cycle (sync or first-load) returns control to idle/disabled. Callers
    /// that arrive while a cycle is running wait for this to change rather than starting their
    /// own cycle.
    cycle_count: u64,
}

type RemoteAddCallback = dyn Fn(&str, &LocalRecord) + Send + Sync;
type MissingRecordCallback = dyn Fn(MissingRemoteRecordStrategy, &LocalRecord) + Send + Sync;

struct Scheduler {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: JoinHandle<()>,
}

/// The sync controller: owns the change log, store, adapter, resolver configuration,
/// persisted state, and the event bus, and drives the push/pull cycle under a single logical
/// mutex held for the duration of push→pull→persist.
pub struct SyncController {
    store: Arc<dyn Store>,
    change_log: Arc<dyn ChangeLog>,
    state_store: Arc<dyn StateStore>,
    adapter: RemoteAdapter,
    events: EventBus,
    config: Config,
    tables: Vec<String>,

    inner: Mutex<Inner>,
    cvar: Condvar,
    enabled: AtomicBool,
    visible: AtomicBool,

    conflicts: Mutex<HashMap<(String, String), Conflict>>,
    api_error: Mutex<Option<ApiError>>,
    last_list_at: Mutex<HashMap<String, Instant>>,

    on_after_remote_add: Mutex<Option<Box<RemoteAddCallback>>>,
    on_after_missing_remote_record: Mutex<Option<Box<MissingRecordCallback>>>,

    scheduler: Mutex<Option<Scheduler>>,
}

impl SyncController {
    /// Constructs the controller in the `disabled` state, the state before the host ever calls
    /// `enable(true)`; the periodic scheduler thread is spawned lazily, on the first
    /// `enable(true)`, and torn down on `Drop`.
    pub fn new(
        store: Arc<dyn Store>,
        change_log: Arc<dyn ChangeLog>,
        state_store: Arc<dyn StateStore>,
        adapter: RemoteAdapter,
        tables: Vec<String>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            change_log,
            state_store,
            adapter,
            events: EventBus::new(),
            config,
            tables,
            inner: Mutex::new(Inner { status: Status::Disabled, cycle_count: 0 }),
            cvar: Condvar::new(),
            enabled: AtomicBool::new(false),
            visible: AtomicBool::new(true),
            conflicts: Mutex::new(HashMap::new()),
            api_error: Mutex::new(None),
            last_list_at: Mutex::new(HashMap::new()),
            on_after_remote_add: Mutex::new(None),
            on_after_missing_remote_record: Mutex::new(None),
            scheduler: Mutex::new(None),
        })
    }

    /// Whether a call site logging at `level` should fire under `min_log_level`; gates the
    /// per-entry push/pull tracing, which is otherwise noisy at the default `info` level.
    fn log_enabled(&self, level: LogLevel) -> bool {
        level.passes(self.config.min_log_level)
    }

    pub fn set_on_after_remote_add(&self, f: impl Fn(&str, &LocalRecord) + Send + Sync + 'static) {
        *self.on_after_remote_add.lock().unwrap() = Some(Box::new(f));
    }

    pub fn set_on_after_missing_remote_record(
        &self,
        f: impl Fn(MissingRemoteRecordStrategy, &LocalRecord) + Send + Sync + 'static,
    ) {
        *self.on_after_missing_remote_record.lock().unwrap() = Some(Box::new(f));
    }

    pub fn subscribe(&self, filter: Option<String>, handler: impl Fn(&MutationEvent) + Send + 'static) -> Subscription {
        self.events.subscribe(filter, handler)
    }

    // ------------------------------------------------------------------
    // Host-facing state machine
    // ------------------------------------------------------------------

    /// `enable(true)` moves `disabled → idle` and (re)starts the periodic scheduler (if
    /// `sync_interval_ms > 0`). `enable(false)` requests cancellation: an in-flight cycle is
    /// allowed to finish its current suspension point, but the controller settles into
    /// `disabled` rather than `idle` once it does, and the scheduler stops ticking.
    pub fn enable(self: &Arc<Self>, on: bool) {
        if on {
            if self.enabled.swap(true, Ordering::SeqCst) {
                return; // already enabled
            }
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.status == Status::Disabled {
                    inner.status = Status::Idle;
                }
            }
            self.cvar.notify_all();
            self.start_scheduler();
        } else {
            self.enabled.store(false, Ordering::SeqCst);
            self.stop_scheduler();
            let mut inner = self.inner.lock().unwrap();
            if inner.status == Status::Idle {
                inner.status = Status::Disabled;
            }
            // If a cycle is in flight, its own completion path observes `enabled == false`
            // and settles into `Disabled` itself (see `settle_after_cycle`).
        }
    }

    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::SeqCst);
    }

    pub fn state(&self) -> Result<SyncState, SyncError> {
        let status = self.inner.lock().unwrap().status;
        let persisted = self.state_store.load()?;
        let pending_changes = self.change_log.length()?;
        let conflicts = self.conflicts.lock().unwrap().values().cloned().collect();
        let api_error = self.api_error.lock().unwrap().clone();
        Ok(SyncState {
            status,
            first_load_done: persisted.first_load_done,
            last_pulled: persisted.last_pulled,
            pending_changes,
            conflicts,
            api_error,
        })
    }

    /// Finalize a conflict the resolver flagged. `prefer_local=true` keeps the local value
    /// (the pending log entry is left untouched, so the next cycle still pushes it — harmlessly,
    /// since the local record already reflects what it will send). `prefer_local=false` adopts
    /// the server's values for exactly the conflicting fields and narrows (or drops) the pending
    /// log entry so a later push doesn't clobber the server's values right back.
    pub fn resolve_conflict(&self, table: &str, local_id: &str, prefer_local: bool) -> Result<(), SyncError> {
        let conflict = { self.conflicts.lock().unwrap().remove(&(table.to_string(), local_id.to_string())) };
        let Some(conflict) = conflict else {
            return Err(SyncError::State("no such conflict".into()));
        };

        if let Some(mut rec) = self.store.get(table, local_id)? {
            let current_fields = rec.fields.clone();
            rec.fields = resolver::apply_resolution(&conflict, &current_fields, prefer_local);
            self.store.put(table, &rec)?;
            self.events.publish(MutationEvent { table: table.to_string(), kind: EventKind::Update });
        }

        if !prefer_local {
            if let Some(overlap) = &conflict.merged_delta {
                if let Some(LogEntry::Update { table: t, local_id: lid, id, delta, base_snapshot }) =
                    self.change_log.get_entry(table, local_id)?
                {
                    let mut narrowed = delta;
                    for key in overlap.keys() {
                        narrowed.remove(key);
                    }
                    if narrowed.is_empty() {
                        self.change_log.drop_entry(table, local_id)?;
                    } else {
                        self.change_log.replace(
                            table,
                            local_id,
                            LogEntry::Update { table: t, local_id: lid, id, delta: narrowed, base_snapshot },
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sync-aware and raw write surfaces
    // ------------------------------------------------------------------

    /// Local insert through the sync-aware surface: writes the record, appends an `Add` entry
    /// to the change log, and publishes a mutation event — atomic with respect to each other in
    /// the sense that the event always reflects a committed store write.
    pub fn insert(&self, table: &str, local_id: impl Into<String>, fields: Payload) -> Result<(), SyncError> {
        let local_id = local_id.into();
        let record = LocalRecord::new(local_id.clone(), fields.clone());
        self.store.add(table, &record)?;
        self.change_log.enqueue(LogEntry::Add { table: table.to_string(), local_id: local_id.clone(), payload: fields })?;
        self.events.publish(MutationEvent { table: table.to_string(), kind: EventKind::Add });
        Ok(())
    }

    /// Local update through the sync-aware surface: merges `delta` into the stored record and
    /// appends/coalesces an `Update` entry carrying the record's already-known remote `id` (if
    /// any) so the log can tell push-ready entries from ones still waiting on an `add`.
    pub fn update(&self, table: &str, local_id: &str, delta: Payload) -> Result<(), SyncError> {
        let base_snapshot = self.store.get(table, local_id)?.map(|r| r.fields).unwrap_or_default();
        self.store.update(table, local_id, &delta)?;
        let id = self.store.get(table, local_id)?.and_then(|r| r.id);
        self.change_log.enqueue(LogEntry::Update {
            table: table.to_string(),
            local_id: local_id.to_string(),
            id,
            delta,
            base_snapshot,
        })?;
        self.events.publish(MutationEvent { table: table.to_string(), kind: EventKind::Update });
        Ok(())
    }

    /// Local delete through the sync-aware surface. If the record never acquired a remote `id`
    /// (no successful push yet), coalescing with a pending `Add` drops the entry entirely;
    /// otherwise a `Remove` entry is queued, carrying the remote `id`.
    pub fn delete(&self, table: &str, local_id: &str) -> Result<(), SyncError> {
        let existing = self.store.get(table, local_id)?;
        let id = existing.as_ref().and_then(|r| r.id.clone()).unwrap_or(serde_json::Value::Null);
        self.store.delete(table, local_id)?;
        // If there's no remote id yet, `id` is `Null`: coalescing against a pending `Add` drops
        // the entry before it would ever be pushed, so the placeholder value is never seen by
        // an adapter.
        self.change_log.enqueue(LogEntry::Remove { table: table.to_string(), local_id: local_id.to_string(), id })?;
        self.events.publish(MutationEvent { table: table.to_string(), kind: EventKind::Remove });
        Ok(())
    }

    /// Bulk sync-aware mutation: apply `delta` to every record in `table` matching `field`/`cmp`,
    /// routing each match through `update` so the change log and event bus observe it exactly
    /// as they would an individual call.
    pub fn modify_matching(&self, table: &str, field: &str, cmp: Comparison<'_>, delta: Payload) -> Result<usize, SyncError> {
        let matched = self.store.where_field(table, field, cmp)?;
        let mut count = 0;
        for record in matched.to_vec() {
            self.update(table, &record.local_id, delta.clone())?;
            count += 1;
        }
        Ok(count)
    }

    /// Bulk sync-aware delete: removes every record in `table` matching `field`/`cmp`, routing
    /// each match through `delete` so it is queued for remote removal.
    pub fn delete_matching(&self, table: &str, field: &str, cmp: Comparison<'_>) -> Result<usize, SyncError> {
        let matched = self.store.where_field(table, field, cmp)?;
        let mut count = 0;
        for record in matched.to_vec() {
            self.delete(table, &record.local_id)?;
            count += 1;
        }
        Ok(count)
    }

    fn raw_upsert(&self, table: &str, record: &LocalRecord, kind: EventKind) -> Result<(), SyncError> {
        self.store.put(table, record)?;
        self.events.publish(MutationEvent { table: table.to_string(), kind });
        Ok(())
    }

    fn raw_delete(&self, table: &str, local_id: &str) -> Result<(), SyncError> {
        self.store.delete(table, local_id)?;
        self.events.publish(MutationEvent { table: table.to_string(), kind: EventKind::Remove });
        Ok(())
    }

    // ------------------------------------------------------------------
    // First load
    // ------------------------------------------------------------------

    pub fn start_first_load(self: &Arc<Self>, progress: Option<&mut ProgressCallback<'_>>) -> Result<(), SyncError> {
        self.run_guarded(Status::FirstLoading, |me| {
            let driver = FirstLoadDriver {
                store: me.store.as_ref(),
                state_store: me.state_store.as_ref(),
                adapter: &me.adapter,
                tables: &me.tables,
            };
            driver.run(progress)
        })
    }

    /// Equivalent to `startFirstLoad` for a host that wants to skip bootstrapping entirely:
    /// marks every table's first load done without ever calling the adapter, so `lastPulled`
    /// stays unset and periodic sync pulls from epoch on its first cycle.
    pub fn skip_first_load(&self) -> Result<(), SyncError> {
        let mut state = self.state_store.load()?;
        FirstLoadDriver::skip(&self.tables, &mut state);
        self.state_store.save(&state)
    }

    // ------------------------------------------------------------------
    // Periodic/explicit sync
    // ------------------------------------------------------------------

    /// Runs one sync cycle, or — if one is already in flight — waits for it to finish and
    /// returns without starting a new one.
    pub fn request_sync_once(self: &Arc<Self>) -> Result<(), SyncError> {
        self.run_guarded(Status::Syncing, |me| me.run_cycle())
    }

    /// Non-blocking variant used by the periodic scheduler: drops the tick entirely if a cycle
    /// is already running rather than waiting for it.
    fn try_tick(self: &Arc<Self>) {
        if !self.enabled.load(Ordering::SeqCst) || !self.visible.load(Ordering::SeqCst) {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.status != Status::Idle {
            return;
        }
        inner.status = Status::Syncing;
        drop(inner);
        if let Err(e) = self.run_cycle() {
            if self.log_enabled(LogLevel::Warn) {
                log::warn!("periodic sync cycle failed: {e}");
            }
        }
        self.settle_after_cycle();
    }

    /// Shared overlap-suppression + state-transition plumbing for `request_sync_once` and
    /// `start_first_load`: only the caller that finds the controller `Idle` actually runs `body`;
    /// everyone else waits for that run's `cycle_count` to advance and returns.
    fn run_guarded(
        self: &Arc<Self>,
        running_status: Status,
        body: impl FnOnce(&Arc<Self>) -> Result<(), SyncError>,
    ) -> Result<(), SyncError> {
        loop {
            let mut inner = self.inner.lock().unwrap();
            match inner.status {
                Status::Disabled => return Ok(()),
                Status::Idle => {
                    inner.status = running_status;
                    break;
                }
                Status::Syncing | Status::FirstLoading => {
                    let start_count = inner.cycle_count;
                    inner = self
                        .cvar
                        .wait_while(inner, |i| i.cycle_count == start_count && i.status != Status::Idle && i.status != Status::Disabled)
                        .unwrap();
                    drop(inner);
                    return Ok(());
                }
            }
        }
        let result = body(self);
        self.settle_after_cycle();
        result
    }

    fn settle_after_cycle(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.status = if self.enabled.load(Ordering::SeqCst) { Status::Idle } else { Status::Disabled };
        inner.cycle_count += 1;
        self.cvar.notify_all();
    }

    fn start_scheduler(self: &Arc<Self>) {
        if self.config.sync_interval_ms == 0 {
            return;
        }
        let mut guard = self.scheduler.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let interval = Duration::from_millis(self.config.sync_interval_ms);
        let me = Arc::clone(self);
        let stop_for_thread = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            let (lock, cvar) = &*stop_for_thread;
            let mut stopped = lock.lock().unwrap();
            loop {
                let (guard, timeout) = cvar.wait_timeout(stopped, interval).unwrap();
                stopped = guard;
                if *stopped {
                    return;
                }
                if timeout.timed_out() {
                    me.try_tick();
                }
            }
        });
        *guard = Some(Scheduler { stop, handle });
    }

    fn stop_scheduler(&self) {
        let scheduler = self.scheduler.lock().unwrap().take();
        if let Some(Scheduler { stop, handle }) = scheduler {
            {
                let (lock, cvar) = &*stop;
                *lock.lock().unwrap() = true;
                cvar.notify_all();
            }
            let _ = handle.join();
        }
    }

    // ------------------------------------------------------------------
    // The per-cycle algorithm
    // ------------------------------------------------------------------

    fn run_cycle(&self) -> Result<(), SyncError> {
        let mut state = self.state_store.load()?;
        *self.api_error.lock().unwrap() = None;

        let aborted = self.push_phase()?;
        let cancelled = !self.enabled.load(Ordering::SeqCst);
        // A push error skips pull only in batch mode, where the single failed call
        // leaves the whole batch's ack state ambiguous. Per-table mode stops pushing further
        // entries but still proceeds to pull, since the entries that did succeed are already
        // acked and the ones that didn't stay queued independently of pull.
        let skip_pull = cancelled || (aborted && matches!(self.adapter, RemoteAdapter::Batch(_)));

        let all_first_loaded = self.tables.iter().all(|t| state.is_first_load_done(t));
        if all_first_loaded && !skip_pull {
            self.pull_phase(&mut state)?;
        } else if !all_first_loaded {
            if self.log_enabled(LogLevel::Debug) {
                log::debug!("skipping pull phase: first load not done for every synced table");
            }
        } else if skip_pull {
            if self.log_enabled(LogLevel::Debug) {
                log::debug!("skipping pull phase: push phase aborted or cancellation requested");
            }
        }

        self.state_store.save(&state)?;
        Ok(())
    }

    /// Returns `true` if the push phase stopped early because of an error (per-table: the failing
    /// entry's table stays queued and iteration over the rest of the head stops; batch: the whole
    /// batch call failed or at least one request in it came back rejected). `run_cycle` decides
    /// whether that should also skip pull: per-table does; batch aborts the whole cycle.
    fn push_phase(&self) -> Result<bool, SyncError> {
        let head = self.change_log.head(PUSH_BATCH_LIMIT)?;
        if head.is_empty() {
            return Ok(false);
        }

        match &self.adapter {
            RemoteAdapter::PerTable(adapters) => {
                for stamped in head {
                    if !self.enabled.load(Ordering::SeqCst) {
                        if self.log_enabled(LogLevel::Info) {
                            log::info!("cancellation observed mid-push; leaving remaining entries queued");
                        }
                        return Ok(true);
                    }
                    let table = stamped.entry.table().to_string();
                    let Some(table_adapter) = adapters.get(&table) else {
                        return Err(SyncError::Programmer("missing adapter for synced table"));
                    };
                    let stop = self.push_one_per_table(table_adapter.as_ref(), &stamped.entry)?;
                    if stop {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            RemoteAdapter::Batch(adapter) => {
                let requests: Vec<PushRequest> = head
                    .iter()
                    .filter_map(|s| to_push_request(&s.entry))
                    .collect();
                if requests.is_empty() {
                    return Ok(false);
                }
                let results = match adapter.push(&requests) {
                    Ok(r) => r,
                    Err(AdapterError::Network(msg)) => {
                        *self.api_error.lock().unwrap() = Some(ApiError::network(None, msg));
                        return Ok(true);
                    }
                    Err(AdapterError::Rejected(msg)) => {
                        *self.api_error.lock().unwrap() = Some(ApiError::server(None, msg));
                        return Ok(true);
                    }
                    Err(AdapterError::NotFound) => {
                        *self.api_error.lock().unwrap() = Some(ApiError::server(None, "unexpected not-found on batch push"));
                        return Ok(true);
                    }
                };

                let mut aborted = false;
                for (request, result) in requests.iter().zip(results.iter()) {
                    if result.success {
                        let outcome = AckOutcome { id: result.id.clone(), updated_at: result.updated_at };
                        self.apply_ack(&request.table, &request.local_id, &outcome, matches!(request.action, PushAction::Add { .. }))?;
                    } else if result.not_found {
                        if matches!(request.action, PushAction::Remove { .. }) {
                            // Already gone server-side: the desired end state (non-existence)
                            // holds, same as the per-table `Remove`/`NotFound` arm.
                            self.change_log.ack(&request.table, &request.local_id, AckOutcome::default())?;
                        } else {
                            self.handle_missing_remote_record(&request.table, &request.local_id)?;
                        }
                    } else {
                        *self.api_error.lock().unwrap() =
                            Some(ApiError::server(request.table.clone(), result.error.clone().unwrap_or_default()));
                        aborted = true;
                    }
                }
                Ok(aborted)
            }
        }
    }

    fn push_one_per_table(
        &self,
        table_adapter: &dyn crate::adapter::TableAdapter,
        entry: &LogEntry,
    ) -> Result<bool, SyncError> {
        let table = entry.table();
        let local_id = entry.local_id();
        match entry {
            LogEntry::Add { payload, .. } => match table_adapter.add(payload) {
                Ok(res) => {
                    self.apply_ack(table, local_id, &AckOutcome { id: Some(res.id), updated_at: Some(res.updated_at) }, true)?;
                    Ok(false)
                }
                Err(e) => Ok(self.record_push_error(table, e)),
            },
            LogEntry::Update { id: Some(id), delta, .. } => {
                let full = self.store.get(table, local_id)?.map(|r| project_outbound(&r)).unwrap_or_default();
                match table_adapter.update(id, delta, &full) {
                    Ok(true) => {
                        self.apply_ack(table, local_id, &AckOutcome::default(), false)?;
                        Ok(false)
                    }
                    Ok(false) => {
                        self.handle_missing_remote_record(table, local_id)?;
                        Ok(false)
                    }
                    Err(e) => Ok(self.record_push_error(table, e)),
                }
            }
            LogEntry::Update { id: None, .. } => {
                // Not push-ready; `head()` shouldn't have returned this, but treat defensively
                // as "nothing to do" rather than erroring the whole cycle.
                Ok(false)
            }
            LogEntry::Remove { id, .. } => match table_adapter.remove(id) {
                Ok(()) => {
                    self.apply_ack(table, local_id, &AckOutcome::default(), false)?;
                    Ok(false)
                }
                Err(AdapterError::NotFound) => {
                    // Already gone server-side: the desired end state (non-existence) holds.
                    self.change_log.ack(table, local_id, AckOutcome::default())?;
                    Ok(false)
                }
                Err(e) => Ok(self.record_push_error(table, e)),
            },
        }
    }

    fn record_push_error(&self, table: &str, err: AdapterError) -> bool {
        *self.api_error.lock().unwrap() = Some(match err {
            AdapterError::Network(msg) => ApiError::network(table.to_string(), msg),
            AdapterError::Rejected(msg) => ApiError::server(table.to_string(), msg),
            AdapterError::NotFound => ApiError::server(table.to_string(), "unexpected not-found"),
        });
        true // stop the push phase
    }

    fn apply_ack(&self, table: &str, local_id: &str, outcome: &AckOutcome, is_add: bool) -> Result<(), SyncError> {
        self.change_log.ack(table, local_id, outcome.clone())?;
        if outcome.id.is_some() || outcome.updated_at.is_some() {
            if let Some(mut rec) = self.store.get(table, local_id)? {
                if let Some(id) = &outcome.id {
                    rec.id = Some(id.clone());
                }
                if let Some(ts) = outcome.updated_at {
                    rec.updated_at = Some(ts);
                }
                self.store.put(table, &rec)?;
                if is_add {
                    if let Some(cb) = self.on_after_remote_add.lock().unwrap().as_ref() {
                        cb(table, &rec);
                    }
                }
            }
        }
        Ok(())
    }

    /// What to do when an `update` comes back "not found".
    fn handle_missing_remote_record(&self, table: &str, local_id: &str) -> Result<(), SyncError> {
        let strategy = self.config.missing_remote_record_during_update_strategy;
        let record = self.store.get(table, local_id)?;

        match strategy {
            MissingRemoteRecordStrategy::Ignore => {
                self.change_log.drop_entry(table, local_id)?;
            }
            MissingRemoteRecordStrategy::DeleteLocalRecord => {
                self.change_log.drop_entry(table, local_id)?;
                self.raw_delete(table, local_id)?;
            }
            MissingRemoteRecordStrategy::InsertRemoteRecord => {
                let payload = record.as_ref().map(project_outbound).unwrap_or_default();
                self.change_log.replace(
                    table,
                    local_id,
                    LogEntry::Add { table: table.to_string(), local_id: local_id.to_string(), payload },
                )?;
            }
        }

        if let (Some(cb), Some(rec)) = (self.on_after_missing_remote_record.lock().unwrap().as_ref(), record.as_ref()) {
            cb(strategy, rec);
        }
        Ok(())
    }

    fn pull_phase(&self, state: &mut crate::state::PersistedState) -> Result<(), SyncError> {
        match &self.adapter {
            RemoteAdapter::PerTable(adapters) => {
                for (table, table_adapter) in adapters.iter() {
                    if !self.enabled.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    if !self.should_list_now(table, table_adapter.list_extra_interval_ms()) {
                        continue;
                    }
                    let since = state.last_pulled(table);
                    let records = match table_adapter.list(since) {
                        Ok(r) => r,
                        Err(AdapterError::Network(msg)) => {
                            *self.api_error.lock().unwrap() = Some(ApiError::network(table.clone(), msg));
                            continue;
                        }
                        Err(AdapterError::Rejected(msg)) => {
                            *self.api_error.lock().unwrap() = Some(ApiError::server(table.clone(), msg));
                            continue;
                        }
                        Err(AdapterError::NotFound) => continue,
                    };
                    self.mark_listed(table);
                    self.apply_pulled(table, records, state)?;
                }
                Ok(())
            }
            RemoteAdapter::Batch(adapter) => {
                let since: HashMap<String, i64> = self.tables.iter().map(|t| (t.clone(), state.last_pulled(t))).collect();
                let pulled = match adapter.pull(&since) {
                    Ok(p) => p,
                    Err(AdapterError::Network(msg)) => {
                        *self.api_error.lock().unwrap() = Some(ApiError::network(None, msg));
                        return Ok(());
                    }
                    Err(AdapterError::Rejected(msg)) => {
                        *self.api_error.lock().unwrap() = Some(ApiError::server(None, msg));
                        return Ok(());
                    }
                    Err(AdapterError::NotFound) => return Ok(()),
                };
                for (table, records) in pulled {
                    self.apply_pulled(&table, records, state)?;
                }
                Ok(())
            }
        }
    }

    fn should_list_now(&self, table: &str, interval_ms: Option<u64>) -> bool {
        let Some(interval_ms) = interval_ms else { return true };
        let last = self.last_list_at.lock().unwrap();
        match last.get(table) {
            Some(t) => t.elapsed() >= Duration::from_millis(interval_ms),
            None => true,
        }
    }

    fn mark_listed(&self, table: &str) {
        self.last_list_at.lock().unwrap().insert(table.to_string(), Instant::now());
    }

    /// Reconcile one table's freshly-pulled remote records against local state.
    fn apply_pulled(&self, table: &str, records: Vec<RemoteRecord>, state: &mut crate::state::PersistedState) -> Result<(), SyncError> {
        for remote in records {
            state.advance_last_pulled(table, remote.updated_at);

            let existing = self.store.find_by_remote_id(table, &remote.id)?;
            match existing {
                Some(mut local) => {
                    let pending = self.change_log.get_entry(table, &local.local_id)?;
                    match pending {
                        Some(LogEntry::Update { delta, .. }) if !remote.deleted => {
                            self.reconcile_conflict(table, &mut local, &delta, &remote)?;
                        }
                        Some(_) => {
                            // A pending `Add`/`Remove` for a record the store also knows a
                            // remote `id` for shouldn't occur (an `Add` entry implies no `id`
                            // yet); skip defensively and let the next cycle's push resolve it.
                        }
                        None => {
                            if remote.deleted {
                                self.raw_delete(table, &local.local_id)?;
                            } else {
                                merge_inbound_into(&mut local, &remote);
                                self.raw_upsert(table, &local, EventKind::Update)?;
                            }
                        }
                    }
                }
                None => {
                    if !remote.deleted {
                        let local_id = derive_local_id(table, &remote.id);
                        let local = project_inbound(&remote, local_id);
                        self.raw_upsert(table, &local, EventKind::Add)?;
                    }
                    // else: tombstone for a record never seen locally — no-op.
                }
            }
        }
        Ok(())
    }

    fn reconcile_conflict(&self, table: &str, local: &mut LocalRecord, pending_delta: &Payload, remote: &RemoteRecord) -> Result<(), SyncError> {
        let outcome = resolver::resolve(
            self.config.conflict_resolution_strategy,
            table,
            &local.local_id,
            pending_delta,
            &local.fields,
            remote,
        );
        match outcome {
            ResolveOutcome::KeepLocal => {
                // Local-wins: spec explicitly says don't change `updated_at` locally either.
                Ok(())
            }
            ResolveOutcome::ApplyRemote { fields } => {
                self.change_log.drop_entry(table, &local.local_id)?;
                local.id = Some(remote.id.clone());
                local.updated_at = Some(remote.updated_at);
                local.fields = fields;
                self.raw_upsert(table, local, EventKind::Update)
            }
            ResolveOutcome::Conflicted { fields, conflict } => {
                local.id = Some(remote.id.clone());
                local.updated_at = Some(remote.updated_at);
                local.fields = fields;
                self.conflicts.lock().unwrap().insert((table.to_string(), local.local_id.clone()), conflict);
                self.raw_upsert(table, local, EventKind::Update)
            }
        }
    }
}

impl Drop for SyncController {
    fn drop(&mut self) {
        self.stop_scheduler();
    }
}

fn to_push_request(entry: &LogEntry) -> Option<PushRequest> {
    match entry {
        LogEntry::Add { table, local_id, payload } => Some(PushRequest {
            table: table.clone(),
            local_id: local_id.clone(),
            action: PushAction::Add { data: payload.clone() },
        }),
        LogEntry::Update { table, local_id, id: Some(id), delta, .. } => Some(PushRequest {
            table: table.clone(),
            local_id: local_id.clone(),
            action: PushAction::Update { id: id.clone(), data: delta.clone() },
        }),
        LogEntry::Update { id: None, .. } => None,
        LogEntry::Remove { table, local_id, id } => Some(PushRequest {
            table: table.clone(),
            local_id: local_id.clone(),
            action: PushAction::Remove { id: id.clone() },
        }),
    }
}
