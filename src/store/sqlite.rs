use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashSet;
use std::sync::Mutex;

use super::{Collection, Comparison, Store};
use crate::error::SyncError;
use crate::record::{LocalRecord, Payload};

/// `Store` implementation backed by an embedded SQL engine (SQLite, via `rusqlite`), following
/// this crate's existing transaction idiom (`unchecked_transaction`, JSON-blob payload columns,
/// a reserved metadata area) rather than requiring one physical SQL table per user schema.
/// Every synced table becomes one physical table `_dync_tbl_<name>` with columns
/// `(local_id TEXT PRIMARY KEY, id TEXT, updated_at INTEGER, data TEXT)`, where `id` and `data`
/// are JSON-encoded. This keeps the store genuinely schema-agnostic: the host never has to
/// declare column types up front.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    known_tables: Mutex<HashSet<String>>,
}

fn physical_name(table: &str) -> Result<String, SyncError> {
    if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(SyncError::UnknownTable(table.to_string()));
    }
    Ok(format!("_dync_tbl_{table}"))
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Self {
        Self { conn: Mutex::new(conn), known_tables: Mutex::new(HashSet::new()) }
    }

    fn ensure_table(&self, table: &str) -> Result<String, SyncError> {
        let physical = physical_name(table)?;
        let mut known = self.known_tables.lock().unwrap();
        if !known.contains(table) {
            let conn = self.conn.lock().unwrap();
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {physical} (
                    local_id TEXT PRIMARY KEY,
                    id TEXT,
                    updated_at INTEGER,
                    data TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{physical}_id ON {physical}(id);"
            ))?;
            known.insert(table.to_string());
        }
        Ok(physical)
    }

    fn row_to_record(local_id: String, id: Option<String>, updated_at: Option<i64>, data: String) -> Result<LocalRecord, SyncError> {
        let fields: Payload = serde_json::from_str(&data)?;
        let id = match id {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };
        Ok(LocalRecord { local_id, id, updated_at, fields })
    }
}

impl Store for SqliteStore {
    fn add(&self, table: &str, record: &LocalRecord) -> Result<(), SyncError> {
        let physical = self.ensure_table(table)?;
        let conn = self.conn.lock().unwrap();
        let id_json = record.id.as_ref().map(serde_json::to_string).transpose()?;
        let data_json = serde_json::to_string(&record.fields)?;
        conn.execute(
            &format!("INSERT INTO {physical}(local_id, id, updated_at, data) VALUES (?1, ?2, ?3, ?4)"),
            params![record.local_id, id_json, record.updated_at, data_json],
        )?;
        Ok(())
    }

    fn put(&self, table: &str, record: &LocalRecord) -> Result<(), SyncError> {
        let physical = self.ensure_table(table)?;
        let conn = self.conn.lock().unwrap();
        let id_json = record.id.as_ref().map(serde_json::to_string).transpose()?;
        let data_json = serde_json::to_string(&record.fields)?;
        conn.execute(
            &format!(
                "INSERT INTO {physical}(local_id, id, updated_at, data) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(local_id) DO UPDATE SET id = excluded.id, updated_at = excluded.updated_at, data = excluded.data"
            ),
            params![record.local_id, id_json, record.updated_at, data_json],
        )?;
        Ok(())
    }

    fn update(&self, table: &str, local_id: &str, delta: &Payload) -> Result<(), SyncError> {
        let physical = self.ensure_table(table)?;
        let conn = self.conn.lock().unwrap();
        let existing: Option<String> = conn
            .query_row(&format!("SELECT data FROM {physical} WHERE local_id = ?1"), params![local_id], |r| r.get(0))
            .optional()?;
        let Some(existing) = existing else {
            return Err(SyncError::State("update on unknown local_id".into()));
        };
        let mut fields: Payload = serde_json::from_str(&existing)?;
        for (k, v) in delta.iter() {
            fields.insert(k.clone(), v.clone());
        }
        let data_json = serde_json::to_string(&fields)?;
        conn.execute(&format!("UPDATE {physical} SET data = ?1 WHERE local_id = ?2"), params![data_json, local_id])?;
        Ok(())
    }

    fn delete(&self, table: &str, local_id: &str) -> Result<(), SyncError> {
        let physical = self.ensure_table(table)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(&format!("DELETE FROM {physical} WHERE local_id = ?1"), params![local_id])?;
        Ok(())
    }

    fn get(&self, table: &str, local_id: &str) -> Result<Option<LocalRecord>, SyncError> {
        let physical = self.ensure_table(table)?;
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT local_id, id, updated_at, data FROM {physical} WHERE local_id = ?1"),
            params![local_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?
        .map(|(lid, id, upd, data)| Self::row_to_record(lid, id, upd, data))
        .transpose()
    }

    fn where_field(&self, table: &str, field: &str, cmp: Comparison<'_>) -> Result<Collection, SyncError> {
        let physical = self.ensure_table(table)?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("SELECT local_id, id, updated_at, data FROM {physical}"))?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, Option<String>>(1)?, r.get::<_, Option<i64>>(2)?, r.get::<_, String>(3)?)))?;

        let mut out = Vec::new();
        for row in rows {
            let (local_id, id, updated_at, data) = row?;
            let record = Self::row_to_record(local_id, id, updated_at, data)?;
            let field_value = match field {
                "id" => record.id.clone(),
                "updated_at" => record.updated_at.map(serde_json::Value::from),
                other => record.fields.get(other).cloned(),
            };
            let Some(field_value) = field_value else { continue };
            let keep = match cmp {
                Comparison::Equals(v) => &field_value == v,
                Comparison::Above(v) => json_gt(&field_value, v),
                Comparison::Below(v) => json_gt(v, &field_value),
            };
            if keep {
                out.push(record);
            }
        }
        Ok(Collection { rows: out })
    }

    fn find_by_remote_id(&self, table: &str, id: &serde_json::Value) -> Result<Option<LocalRecord>, SyncError> {
        let physical = self.ensure_table(table)?;
        let conn = self.conn.lock().unwrap();
        let id_json = serde_json::to_string(id)?;
        conn.query_row(
            &format!("SELECT local_id, id, updated_at, data FROM {physical} WHERE id = ?1"),
            params![id_json],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?
        .map(|(lid, rid, upd, data)| Self::row_to_record(lid, rid, upd, data))
        .transpose()
    }

    fn all(&self, table: &str) -> Result<Vec<LocalRecord>, SyncError> {
        let physical = self.ensure_table(table)?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("SELECT local_id, id, updated_at, data FROM {physical} ORDER BY local_id"))?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, Option<String>>(1)?, r.get::<_, Option<i64>>(2)?, r.get::<_, String>(3)?)))?;
        let mut out = Vec::new();
        for row in rows {
            let (lid, id, upd, data) = row?;
            out.push(Self::row_to_record(lid, id, upd, data)?);
        }
        Ok(out)
    }
}

fn json_gt(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a > b,
        _ => a.as_str().zip(b.as_str()).map(|(a, b)| a > b).unwrap_or(false),
    }
}
