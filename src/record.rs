use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Untyped payload fields, keyed by column/field name. The engine never interprets these beyond
/// the projection and merge rules below; domain shape is entirely the host's concern.
pub type Payload = serde_json::Map<String, Value>;

/// A record as the local store holds it: always has a `_localId`, may or may not yet have a
/// server `id`, and carries `updated_at` only once the server has assigned one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub local_id: String,
    pub id: Option<Value>,
    pub updated_at: Option<i64>,
    #[serde(flatten)]
    pub fields: Payload,
}

impl LocalRecord {
    pub fn new(local_id: impl Into<String>, fields: Payload) -> Self {
        Self { local_id: local_id.into(), id: None, updated_at: None, fields }
    }
}

/// A record as the remote holds it: `id`/`updated_at` are mandatory, `deleted` marks a
/// tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: Value,
    pub updated_at: i64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(flatten)]
    pub fields: Payload,
}

/// Strip `_localId` and the engine-private envelope, leaving only what should cross the wire
/// on an `add`/`update`.
pub fn project_outbound(local: &LocalRecord) -> Payload {
    local.fields.clone()
}

/// Build the local shape for a freshly-pulled remote record, assigning a new `_localId`.
/// `deleted` records should be filtered out by the caller before reaching this function; it
/// is only meaningful for live (non-tombstone) records.
pub fn project_inbound(remote: &RemoteRecord, local_id: impl Into<String>) -> LocalRecord {
    LocalRecord {
        local_id: local_id.into(),
        id: Some(remote.id.clone()),
        updated_at: Some(remote.updated_at),
        fields: remote.fields.clone(),
    }
}

/// Overlay the remote record's fields onto an existing local record in place, preserving
/// `_localId` and updating `id`/`updated_at` from the remote (used for the non-conflicting
/// upsert path of the per-cycle reconciliation).
pub fn merge_inbound_into(local: &mut LocalRecord, remote: &RemoteRecord) {
    local.id = Some(remote.id.clone());
    local.updated_at = Some(remote.updated_at);
    local.fields = remote.fields.clone();
}

/// `_localId` assigned to a record that originates from the remote (pull or first-load), rather
/// than from a local insert. Rather than injecting a generated UUID, a remote-originated record
/// derives its `_localId` from the table and the already-authoritative remote `id`, which is
/// stable and unique for the life of the record.
pub fn derive_local_id(table: &str, remote_id: &Value) -> String {
    format!("{table}:{remote_id}")
}

/// Re-hydrate integer `0`/`1` columns into booleans for back-ends that cannot natively store
/// booleans. `bool_fields` names the columns to normalize; values already boolean are
/// left untouched.
pub fn normalize_bool_fields(fields: &mut Payload, bool_fields: &[&str]) {
    for name in bool_fields {
        if let Some(v) = fields.get_mut(*name) {
            if let Some(n) = v.as_i64() {
                *v = Value::Bool(n != 0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outbound_drops_local_only_fields() {
        let mut fields = Payload::new();
        fields.insert("title".into(), json!("a"));
        let mut local = LocalRecord::new("loc-1", fields);
        local.id = Some(json!(7));
        local.updated_at = Some(1000);

        let outbound = project_outbound(&local);
        assert!(!outbound.contains_key("_localId"));
        assert!(!outbound.contains_key("id"));
        assert!(!outbound.contains_key("updated_at"));
        assert_eq!(outbound.get("title"), Some(&json!("a")));
    }

    #[test]
    fn inbound_assigns_fresh_local_id() {
        let mut fields = Payload::new();
        fields.insert("title".into(), json!("srv"));
        let remote = RemoteRecord { id: json!(42), updated_at: 2000, deleted: false, fields };

        let local = project_inbound(&remote, "loc-new");
        assert_eq!(local.local_id, "loc-new");
        assert_eq!(local.id, Some(json!(42)));
        assert_eq!(local.updated_at, Some(2000));
    }

    #[test]
    fn bool_normalization_rehydrates_integers() {
        let mut fields = Payload::new();
        fields.insert("completed".into(), json!(1));
        fields.insert("archived".into(), json!(false));
        normalize_bool_fields(&mut fields, &["completed", "archived"]);
        assert_eq!(fields.get("completed"), Some(&json!(true)));
        assert_eq!(fields.get("archived"), Some(&json!(false)));
    }
}
