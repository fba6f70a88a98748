//! The conflict resolver: activated when a pull delivers a record whose `_localId` has
//! an in-flight local update, and decides between local-wins, remote-wins, and shallow-merge
//! strategies for reconciling the two.

use crate::config::ConflictStrategy;
use crate::record::{Payload, RemoteRecord};

#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub table: String,
    pub local_id: String,
    pub local: Payload,
    pub remote: Payload,
    pub merged_delta: Option<Payload>,
}

pub enum ResolveOutcome {
    /// The pending local edit wins outright; the remote record is discarded, `updated_at`
    /// stays as-is locally (local-wins).
    KeepLocal,
    /// The remote record wins outright; the log entry for this `_localId` is dropped
    /// (remote-wins, or shallow-merge with no field overlap).
    ApplyRemote { fields: Payload },
    /// Shallow-merge found overlapping fields with different values: the local record is left
    /// at the merged-but-still-divergent state and a conflict is recorded.
    Conflicted { fields: Payload, conflict: Conflict },
}

/// Deep-equal on scalars, `Value`-equal (which is structural) on composites; `null` and
/// "missing" are distinct because one is `Some(Value::Null)` and the other is `None`.
fn fields_differ(local: &serde_json::Value, remote: &serde_json::Value) -> bool {
    local != remote
}

/// Resolve one pulled record against a table/local-id that has a pending local `update` whose
/// field delta is `pending_delta`. `local_full` is the record's current full local payload.
pub fn resolve(
    strategy: ConflictStrategy,
    table: &str,
    local_id: &str,
    pending_delta: &Payload,
    local_full: &Payload,
    remote: &RemoteRecord,
) -> ResolveOutcome {
    match strategy {
        ConflictStrategy::LocalWins => ResolveOutcome::KeepLocal,
        ConflictStrategy::RemoteWins => ResolveOutcome::ApplyRemote { fields: remote.fields.clone() },
        ConflictStrategy::TryShallowMerge => {
            let mut merged = local_full.clone();
            let mut overlap = Payload::new();

            for (key, remote_value) in remote.fields.iter() {
                match pending_delta.get(key) {
                    None => {
                        // Not part of the pending local edit: the remote value always wins.
                        merged.insert(key.clone(), remote_value.clone());
                    }
                    Some(local_value) => {
                        if fields_differ(local_value, remote_value) {
                            overlap.insert(key.clone(), remote_value.clone());
                        }
                        // else: both sides agree, nothing to do.
                    }
                }
            }

            if overlap.is_empty() {
                ResolveOutcome::ApplyRemote { fields: merged }
            } else {
                let conflict = Conflict {
                    table: table.to_string(),
                    local_id: local_id.to_string(),
                    local: local_full.clone(),
                    remote: remote.fields.clone(),
                    merged_delta: Some(overlap),
                };
                ResolveOutcome::Conflicted { fields: merged, conflict }
            }
        }
    }
}

/// Apply a host's conflict resolution decision (`resolveConflict(_localId, preferLocal)`).
/// Returns the field values that should be written onto the local record.
///
/// `current_fields` is the record's fields as they stand right now — already shallow-merged,
/// so every non-conflicting field has the remote's value and every conflicting field still
/// holds the local one. `prefer_local=true` keeps that as-is; `prefer_local=false` overlays the
/// conflict's `merged_delta` (the remote's values for exactly the conflicting fields) on top.
/// Basing this on `conflict.local` instead, the record's state *before* the shallow merge, would
/// silently revert every non-conflicting field the merge had already applied.
pub fn apply_resolution(conflict: &Conflict, current_fields: &Payload, prefer_local: bool) -> Payload {
    let mut out = current_fields.clone();
    if !prefer_local {
        if let Some(delta) = &conflict.merged_delta {
            for (k, v) in delta.iter() {
                out.insert(k.clone(), v.clone());
            }
        }
    }
    out
}
