use std::collections::HashMap;
use std::sync::Mutex;

use super::{Collection, Comparison, Store};
use crate::error::SyncError;
use crate::record::{LocalRecord, Payload};

/// In-process `Store` backed by a `HashMap` per table. Used by the test suite and by hosts that
/// don't need the local state to outlive the process.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, HashMap<String, LocalRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn field_value(record: &LocalRecord, field: &str) -> Option<serde_json::Value> {
    match field {
        "id" => record.id.clone(),
        "updated_at" => record.updated_at.map(serde_json::Value::from),
        other => record.fields.get(other).cloned(),
    }
}

fn json_gt(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a > b,
        _ => a.as_str().zip(b.as_str()).map(|(a, b)| a > b).unwrap_or(false),
    }
}

impl Store for MemoryStore {
    fn add(&self, table: &str, record: &LocalRecord) -> Result<(), SyncError> {
        let mut tables = self.tables.lock().unwrap();
        let t = tables.entry(table.to_string()).or_default();
        if t.contains_key(&record.local_id) {
            return Err(SyncError::State("add on existing local_id".into()));
        }
        t.insert(record.local_id.clone(), record.clone());
        Ok(())
    }

    fn put(&self, table: &str, record: &LocalRecord) -> Result<(), SyncError> {
        let mut tables = self.tables.lock().unwrap();
        tables.entry(table.to_string()).or_default().insert(record.local_id.clone(), record.clone());
        Ok(())
    }

    fn update(&self, table: &str, local_id: &str, delta: &Payload) -> Result<(), SyncError> {
        let mut tables = self.tables.lock().unwrap();
        let t = tables.entry(table.to_string()).or_default();
        let record = t.get_mut(local_id).ok_or(SyncError::State("update on unknown local_id".into()))?;
        for (k, v) in delta.iter() {
            record.fields.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    fn delete(&self, table: &str, local_id: &str) -> Result<(), SyncError> {
        let mut tables = self.tables.lock().unwrap();
        tables.entry(table.to_string()).or_default().remove(local_id);
        Ok(())
    }

    fn get(&self, table: &str, local_id: &str) -> Result<Option<LocalRecord>, SyncError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.get(table).and_then(|t| t.get(local_id)).cloned())
    }

    fn where_field(&self, table: &str, field: &str, cmp: Comparison<'_>) -> Result<Collection, SyncError> {
        let tables = self.tables.lock().unwrap();
        let rows = tables
            .get(table)
            .map(|t| {
                t.values()
                    .filter(|r| match field_value(r, field) {
                        Some(v) => match cmp {
                            Comparison::Equals(want) => &v == want,
                            Comparison::Above(want) => json_gt(&v, want),
                            Comparison::Below(want) => json_gt(want, &v),
                        },
                        None => false,
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(Collection { rows })
    }

    fn find_by_remote_id(&self, table: &str, id: &serde_json::Value) -> Result<Option<LocalRecord>, SyncError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.get(table).and_then(|t| t.values().find(|r| r.id.as_ref() == Some(id))).cloned())
    }

    fn all(&self, table: &str) -> Result<Vec<LocalRecord>, SyncError> {
        let tables = self.tables.lock().unwrap();
        let mut rows: Vec<_> = tables.get(table).map(|t| t.values().cloned().collect()).unwrap_or_default();
        rows.sort_by(|a, b| a.local_id.cmp(&b.local_id));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn add_rejects_duplicate_local_id() {
        let store = MemoryStore::new();
        let record = LocalRecord::new("l1", Payload::new());
        store.add("trips", &record).unwrap();
        assert!(store.add("trips", &record).is_err());
    }

    #[test]
    fn find_by_remote_id_scans_table() {
        let store = MemoryStore::new();
        let mut record = LocalRecord::new("l1", Payload::new());
        record.id = Some(json!(9));
        store.put("trips", &record).unwrap();

        assert!(store.find_by_remote_id("trips", &json!(9)).unwrap().is_some());
        assert!(store.find_by_remote_id("trips", &json!(10)).unwrap().is_none());
    }
}
