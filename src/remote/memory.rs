//! In-process remote backend
//!
//! Holds tables as JSON rows and lets callers toggle connectivity, inject
//! rejections and write failures, and add latency. Used by the test suite and
//! by the CLI when no remote URL is configured.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use serde_json::Value;

use super::{RemoteBackend, RemoteError, RemoteResult};
use crate::types::{payload_id, payload_timestamp};

#[derive(Default)]
struct Faults {
    rejected_ids: HashSet<(String, String)>,
    rejected_tables: HashSet<String>,
    write_failure: Option<RemoteError>,
    latency: Duration,
}

pub struct InMemoryBackend {
    tables: RwLock<BTreeMap<String, Vec<Value>>>,
    online: AtomicBool,
    session: AtomicBool,
    faults: RwLock<Faults>,
    selects: AtomicUsize,
    writes: AtomicUsize,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(BTreeMap::new()),
            online: AtomicBool::new(true),
            session: AtomicBool::new(true),
            faults: RwLock::new(Faults::default()),
            selects: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    // ========================================================================
    // Fixture helpers
    // ========================================================================

    /// Append rows verbatim (malformed rows included)
    pub fn seed(&self, table: &str, rows: Vec<Value>) {
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    /// Insert or replace a row by id
    pub fn put_row(&self, table: &str, row: Value) {
        let mut tables = self.tables.write();
        let rows = tables.entry(table.to_string()).or_default();
        let id = payload_id(&row);
        match rows.iter_mut().find(|r| id.is_some() && payload_id(r) == id) {
            Some(existing) => *existing = row,
            None => rows.push(row),
        }
    }

    pub fn remove_row(&self, table: &str, id: &str) -> bool {
        let mut tables = self.tables.write();
        let Some(rows) = tables.get_mut(table) else {
            return false;
        };
        let before = rows.len();
        rows.retain(|r| payload_id(r).as_deref() != Some(id));
        rows.len() != before
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables.read().get(table).cloned().unwrap_or_default()
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Value> {
        self.tables
            .read()
            .get(table)
            .and_then(|rows| rows.iter().find(|r| payload_id(r).as_deref() == Some(id)))
            .cloned()
    }

    // ========================================================================
    // Fault injection
    // ========================================================================

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_session(&self, present: bool) {
        self.session.store(present, Ordering::SeqCst);
    }

    /// Reject every write touching this record
    pub fn reject_record(&self, table: &str, id: &str) {
        self.faults
            .write()
            .rejected_ids
            .insert((table.to_string(), id.to_string()));
    }

    /// Reject every write to this table
    pub fn reject_table(&self, table: &str) {
        self.faults
            .write()
            .rejected_tables
            .insert(table.to_string());
    }

    /// Fail every write with this error until cleared
    pub fn set_write_failure(&self, error: Option<RemoteError>) {
        self.faults.write().write_failure = error;
    }

    /// Delay applied to every call
    pub fn set_latency(&self, latency: Duration) {
        self.faults.write().latency = latency;
    }

    pub fn select_calls(&self) -> usize {
        self.selects.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn enter(&self) -> RemoteResult<()> {
        let latency = self.faults.read().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("backend unreachable".to_string()));
        }
        Ok(())
    }

    async fn enter_write(&self, table: &str, id: Option<&str>) -> RemoteResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;

        let faults = self.faults.read();
        if let Some(error) = &faults.write_failure {
            return Err(error.clone());
        }
        let rejected = faults.rejected_tables.contains(table)
            || id.is_some_and(|id| {
                faults
                    .rejected_ids
                    .contains(&(table.to_string(), id.to_string()))
            });
        if rejected {
            return Err(RemoteError::Rejected {
                status: 409,
                message: format!("write to {} violates a constraint", table),
            });
        }
        Ok(())
    }

    /// Set `updated_at` to the write time, like the hosted store's trigger
    fn stamp(row: &mut Value) {
        if let Some(obj) = row.as_object_mut() {
            obj.insert(
                "updated_at".to_string(),
                Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
            );
        }
    }

    fn merge_into(target: &mut Value, patch: &Value) {
        if let (Some(target), Some(patch)) = (target.as_object_mut(), patch.as_object()) {
            for (key, value) in patch {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

#[async_trait]
impl RemoteBackend for InMemoryBackend {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn has_session(&self) -> bool {
        self.session.load(Ordering::SeqCst)
    }

    async fn select(&self, table: &str, since: Option<DateTime<Utc>>) -> RemoteResult<Vec<Value>> {
        self.selects.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;

        let rows = self.rows(table);
        Ok(match since {
            None => rows,
            Some(since) => rows
                .into_iter()
                .filter(|r| payload_timestamp(r, "updated_at").is_some_and(|at| at >= since))
                .collect(),
        })
    }

    async fn insert(&self, table: &str, row: &Value) -> RemoteResult<Option<Value>> {
        let id = payload_id(row).ok_or_else(|| RemoteError::Rejected {
            status: 400,
            message: "row has no id".to_string(),
        })?;
        self.enter_write(table, Some(&id)).await?;

        if self.row(table, &id).is_some() {
            return Err(RemoteError::Rejected {
                status: 409,
                message: format!("duplicate key {} in {}", id, table),
            });
        }

        let mut stored = row.clone();
        Self::stamp(&mut stored);
        self.put_row(table, stored.clone());
        Ok(Some(stored))
    }

    async fn update(&self, table: &str, id: &str, patch: &Value) -> RemoteResult<Option<Value>> {
        self.enter_write(table, Some(id)).await?;

        let mut stored = self.row(table, id).ok_or_else(|| RemoteError::Rejected {
            status: 404,
            message: format!("{} {} does not exist", table, id),
        })?;
        Self::merge_into(&mut stored, patch);
        Self::stamp(&mut stored);
        self.put_row(table, stored.clone());
        Ok(Some(stored))
    }

    async fn delete(&self, table: &str, id: &str) -> RemoteResult<()> {
        self.enter_write(table, Some(id)).await?;
        self.remove_row(table, id);
        Ok(())
    }

    async fn upsert(&self, table: &str, rows: &[Value]) -> RemoteResult<Vec<Value>> {
        self.enter_write(table, None).await?;

        let mut stored_rows = Vec::with_capacity(rows.len());
        for row in rows {
            let id = payload_id(row).ok_or_else(|| RemoteError::Rejected {
                status: 400,
                message: "row has no id".to_string(),
            })?;
            let mut stored = self.row(table, &id).unwrap_or_else(|| Value::Object(Default::default()));
            Self::merge_into(&mut stored, row);
            Self::stamp(&mut stored);
            self.put_row(table, stored.clone());
            stored_rows.push(stored);
        }
        Ok(stored_rows)
    }
}
