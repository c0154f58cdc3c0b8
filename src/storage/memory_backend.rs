//! In-memory `LocalStore`
//!
//! Used for ephemeral sessions and tests. Nothing survives the process.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use super::backend::LocalStore;
use crate::error::Result;
use crate::types::{CachedRecord, QueueEntryId, QueuedChange, RecordId, TableMeta};

#[derive(Default)]
struct Inner {
    records: BTreeMap<String, BTreeMap<RecordId, CachedRecord>>,
    changes: HashMap<QueueEntryId, QueuedChange>,
    meta: HashMap<String, TableMeta>,
}

/// Process-local store
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    invalidated: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn put_records(&self, records: &[CachedRecord]) -> Result<()> {
        let mut inner = self.inner.write();
        for record in records {
            inner
                .records
                .entry(record.table.clone())
                .or_default()
                .insert(record.id.clone(), record.clone());
        }
        Ok(())
    }

    fn get_record(&self, table: &str, id: &str) -> Result<Option<CachedRecord>> {
        Ok(self
            .inner
            .read()
            .records
            .get(table)
            .and_then(|rows| rows.get(id))
            .cloned())
    }

    fn load_records(&self, table: &str) -> Result<Vec<CachedRecord>> {
        Ok(self
            .inner
            .read()
            .records
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    fn tables(&self) -> Result<Vec<String>> {
        Ok(self
            .inner
            .read()
            .records
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn delete_record(&self, table: &str, id: &str) -> Result<bool> {
        Ok(self
            .inner
            .write()
            .records
            .get_mut(table)
            .and_then(|rows| rows.remove(id))
            .is_some())
    }

    fn clear_table(&self, table: &str) -> Result<usize> {
        Ok(self
            .inner
            .write()
            .records
            .remove(table)
            .map(|rows| rows.len())
            .unwrap_or(0))
    }

    fn save_change(&self, change: &QueuedChange) -> Result<()> {
        self.inner.write().changes.insert(change.id, change.clone());
        Ok(())
    }

    fn delete_change(&self, id: QueueEntryId) -> Result<bool> {
        Ok(self.inner.write().changes.remove(&id).is_some())
    }

    fn load_changes(&self) -> Result<Vec<QueuedChange>> {
        let mut changes: Vec<QueuedChange> =
            self.inner.read().changes.values().cloned().collect();
        changes.sort_by_key(|c| c.seq);
        Ok(changes)
    }

    fn get_meta(&self, table: &str) -> Result<Option<TableMeta>> {
        Ok(self.inner.read().meta.get(table).cloned())
    }

    fn set_meta(&self, meta: &TableMeta) -> Result<()> {
        self.inner
            .write()
            .meta
            .insert(meta.table.clone(), meta.clone());
        Ok(())
    }

    fn clear_meta(&self) -> Result<()> {
        self.inner.write().meta.clear();
        Ok(())
    }

    fn set_invalidated(&self, invalidated: bool) -> Result<()> {
        self.invalidated.store(invalidated, Ordering::Release);
        Ok(())
    }

    fn is_invalidated(&self) -> Result<bool> {
        Ok(self.invalidated.load(Ordering::Acquire))
    }

    fn size_bytes(&self) -> Result<Option<u64>> {
        Ok(None)
    }
}
