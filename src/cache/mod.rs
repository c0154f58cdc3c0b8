//! Local cache store
//!
//! In-memory mirror of remote tables, written through to a `LocalStore` so
//! the last-synced snapshot survives a restart. Reads never touch the
//! durable store. Writes are last-writer-wins on `updated_at`: a record older
//! than the cached one for the same `(table, id)` is ignored.

mod backup;
mod events;

pub use backup::{detect_format, merge_backups, normalize_backup, parse_backup, BackupFormat};
pub use events::{CacheEvent, CacheEventKind, EventFilter, WriteSource};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::error::{Result, SyncError};
use crate::storage::DurableStore;
use crate::types::{
    now_micros, payload_id, payload_timestamp, CachedRecord, RecordId, Snapshot, StorageInfo,
    TableMeta,
};

type TableRows = BTreeMap<RecordId, CachedRecord>;

/// Offline cache of remote tables
pub struct CacheStore {
    durable: Arc<DurableStore>,
    tables: RwLock<BTreeMap<String, TableRows>>,
    meta: RwLock<HashMap<String, TableMeta>>,
    events: broadcast::Sender<CacheEvent>,
}

impl CacheStore {
    /// Load the cached snapshot from durable storage
    pub fn open(durable: Arc<DurableStore>) -> Result<Self> {
        let mut tables: BTreeMap<String, TableRows> = BTreeMap::new();
        let mut loaded = 0usize;

        for table in durable.store().tables()? {
            let rows = durable.store().load_records(&table)?;
            loaded += rows.len();
            tables.insert(
                table,
                rows.into_iter().map(|r| (r.id.clone(), r)).collect(),
            );
        }

        if loaded > 0 {
            tracing::info!(
                "Loaded {} cached records across {} tables from {}",
                loaded,
                tables.len(),
                durable.store().kind()
            );
        }

        let (events, _) = broadcast::channel(1024);
        Ok(Self {
            durable,
            tables: RwLock::new(tables),
            meta: RwLock::new(HashMap::new()),
            events,
        })
    }

    /// Subscribe to cache write events
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: CacheEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// All cached records of a table, ordered by id
    pub fn get_data(&self, table: &str) -> Vec<CachedRecord> {
        self.tables
            .read()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_item(&self, table: &str, id: &str) -> Option<CachedRecord> {
        self.tables
            .read()
            .get(table)
            .and_then(|rows| rows.get(id))
            .cloned()
    }

    pub fn contains(&self, table: &str, id: &str) -> bool {
        self.tables
            .read()
            .get(table)
            .is_some_and(|rows| rows.contains_key(id))
    }

    pub fn ids(&self, table: &str) -> Vec<RecordId> {
        self.tables
            .read()
            .get(table)
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether any table holds at least one record
    pub fn has_cached_data(&self) -> bool {
        self.tables.read().values().any(|rows| !rows.is_empty())
    }

    pub fn is_memory_only(&self) -> bool {
        self.durable.is_memory_only()
    }

    pub fn storage_info(&self) -> StorageInfo {
        let tables = self.tables.read();
        let mut info = StorageInfo {
            memory_only: self.durable.is_memory_only(),
            quota_bytes: self.durable.store().quota_bytes(),
            ..Default::default()
        };

        for (name, rows) in tables.iter() {
            if rows.is_empty() {
                continue;
            }
            info.table_counts.insert(name.clone(), rows.len());
            info.total_bytes += rows.values().map(CachedRecord::byte_size).sum::<u64>();
        }

        if !info.memory_only {
            info.durable_bytes = self.durable.store().size_bytes().unwrap_or_else(|e| {
                tracing::debug!("Could not read durable store size: {}", e);
                None
            });
        }
        info
    }

    /// Timestamp for a local write: never behind the cached version
    pub fn next_local_timestamp(&self, table: &str, id: &str) -> DateTime<Utc> {
        let now = now_micros();
        match self.get_item(table, id) {
            Some(existing) if existing.updated_at > now => existing.updated_at,
            _ => now,
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Store a record unless a newer version is already cached.
    /// Returns whether the record was applied.
    pub fn put(&self, record: CachedRecord, source: WriteSource) -> bool {
        self.put_many(vec![record], source) == 1
    }

    /// Store records, skipping any older than the cached version.
    /// Returns how many were applied.
    pub fn put_many(&self, records: Vec<CachedRecord>, source: WriteSource) -> usize {
        let mut tables = self.tables.write();
        let mut accepted = Vec::with_capacity(records.len());

        for record in records {
            let rows = tables.entry(record.table.clone()).or_default();
            if let Some(existing) = rows.get(&record.id) {
                if existing.updated_at > record.updated_at {
                    tracing::debug!(
                        "Ignoring stale {} write for {}/{} ({} < {})",
                        source_name(source),
                        record.table,
                        record.id,
                        record.updated_at,
                        existing.updated_at
                    );
                    continue;
                }
            }
            rows.insert(record.id.clone(), record.clone());
            accepted.push(record);
        }

        if accepted.is_empty() {
            return 0;
        }

        let persisted = self
            .durable
            .write("cache put", |store| store.put_records(&accepted));

        for record in &accepted {
            self.publish(CacheEvent::upserted(
                &record.table,
                &record.id,
                source,
                persisted,
            ));
        }
        accepted.len()
    }

    /// Store the backend's echo of an acknowledged write.
    ///
    /// The payload is replaced outright; `updated_at` never moves backwards.
    pub fn confirm(&self, mut record: CachedRecord) {
        if let Some(existing) = self.get_item(&record.table, &record.id) {
            record.updated_at = record.updated_at.max(existing.updated_at);
        }
        self.overwrite(vec![record], WriteSource::Remote);
    }

    /// Store records regardless of timestamps
    fn overwrite(&self, records: Vec<CachedRecord>, source: WriteSource) -> usize {
        let mut tables = self.tables.write();
        for record in &records {
            tables
                .entry(record.table.clone())
                .or_default()
                .insert(record.id.clone(), record.clone());
        }
        let persisted = self
            .durable
            .write("cache restore", |store| store.put_records(&records));
        for record in &records {
            self.publish(CacheEvent::upserted(
                &record.table,
                &record.id,
                source,
                persisted,
            ));
        }
        records.len()
    }

    /// Remove a record. Returns whether it was cached.
    pub fn remove(&self, table: &str, id: &str, source: WriteSource) -> bool {
        let mut tables = self.tables.write();
        let removed = tables
            .get_mut(table)
            .and_then(|rows| rows.remove(id))
            .is_some();

        let persisted = self.durable.remove("cache delete", |store| {
            store.delete_record(table, id).map(|_| ())
        });

        if removed {
            self.publish(CacheEvent::removed(table, id, source, persisted));
        }
        removed
    }

    /// Drop every cached record of a table
    pub fn clear_table(&self, table: &str) -> usize {
        let mut tables = self.tables.write();
        let removed = tables.remove(table).map(|rows| rows.len()).unwrap_or(0);

        let persisted = self.durable.remove("cache clear", |store| {
            store.clear_table(table).map(|_| ())
        });

        self.publish(CacheEvent::table_cleared(
            table,
            WriteSource::Remote,
            persisted,
        ));
        removed
    }

    // ========================================================================
    // Sync metadata
    // ========================================================================

    /// Staleness marker for a table
    pub fn meta(&self, table: &str) -> Option<TableMeta> {
        if let Some(meta) = self.meta.read().get(table) {
            return Some(meta.clone());
        }
        if self.durable.is_memory_only() {
            return None;
        }

        match self.durable.store().get_meta(table) {
            Ok(Some(meta)) => {
                self.meta.write().insert(table.to_string(), meta.clone());
                Some(meta)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Could not read sync metadata for {}: {}", table, e);
                None
            }
        }
    }

    pub fn set_meta(&self, meta: TableMeta) {
        self.durable
            .write("sync meta", |store| store.set_meta(&meta));
        self.meta.write().insert(meta.table.clone(), meta);
    }

    /// Forget every staleness marker so the next pull is a full one
    pub fn clear_meta(&self) {
        self.meta.write().clear();
        self.durable.remove("sync meta clear", |store| store.clear_meta());
    }

    // ========================================================================
    // Backup / restore
    // ========================================================================

    /// Payloads of every cached table
    pub fn export_snapshot(&self) -> Snapshot {
        self.tables
            .read()
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(name, rows)| {
                (
                    name.clone(),
                    rows.values().map(|r| r.payload.clone()).collect(),
                )
            })
            .collect()
    }

    /// Import payloads, replacing cached versions of the same ids.
    ///
    /// Every row must carry an `id`; `updated_at` is taken from the payload
    /// when present. Returns the number of records imported.
    pub fn import_snapshot(&self, snapshot: Snapshot) -> Result<usize> {
        let mut records = Vec::new();
        let fallback = now_micros();

        for (table, rows) in snapshot {
            for (idx, payload) in rows.into_iter().enumerate() {
                let id = payload_id(&payload).ok_or_else(|| {
                    SyncError::MalformedRecord(format!(
                        "{} row {} in snapshot has no id",
                        table, idx
                    ))
                })?;
                let updated_at = payload_timestamp(&payload, "updated_at").unwrap_or(fallback);
                records.push(CachedRecord::new(table.clone(), id, payload, updated_at));
            }
        }

        Ok(self.overwrite(records, WriteSource::Restore))
    }
}

fn source_name(source: WriteSource) -> &'static str {
    match source {
        WriteSource::Local => "local",
        WriteSource::Remote => "remote",
        WriteSource::Restore => "restore",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LocalStore, MemoryStore};
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn cache() -> CacheStore {
        CacheStore::open(Arc::new(DurableStore::new(Arc::new(MemoryStore::new())))).unwrap()
    }

    fn record(id: &str, name: &str, at: DateTime<Utc>) -> CachedRecord {
        CachedRecord::new("clients", id, json!({"id": id, "name": name}), at)
    }

    #[test]
    fn test_last_writer_wins() {
        let cache = cache();
        let now = now_micros();

        assert!(cache.put(record("c1", "new", now), WriteSource::Remote));
        assert!(!cache.put(
            record("c1", "old", now - Duration::seconds(5)),
            WriteSource::Remote
        ));
        assert_eq!(cache.get_item("clients", "c1").unwrap().payload["name"], "new");

        // Equal timestamps: the later write wins
        assert!(cache.put(record("c1", "same-time", now), WriteSource::Local));
        assert_eq!(
            cache.get_item("clients", "c1").unwrap().payload["name"],
            "same-time"
        );
    }

    #[test]
    fn test_local_timestamp_never_goes_backwards() {
        let cache = cache();
        let future = now_micros() + Duration::hours(1);
        cache.put(record("c1", "from-future", future), WriteSource::Remote);

        assert_eq!(cache.next_local_timestamp("clients", "c1"), future);
        assert!(cache.next_local_timestamp("clients", "other") < future);
    }

    #[test]
    fn test_writes_reach_store_and_events() {
        let store = Arc::new(MemoryStore::new());
        let cache = CacheStore::open(Arc::new(DurableStore::new(store.clone()))).unwrap();
        let mut events = cache.subscribe();

        cache.put(record("c1", "Acme", now_micros()), WriteSource::Local);
        assert!(store.get_record("clients", "c1").unwrap().is_some());

        let event = events.try_recv().unwrap();
        assert_eq!(event.kind, CacheEventKind::Upserted);
        assert_eq!(event.record_id.as_deref(), Some("c1"));
        assert!(event.persisted);

        assert!(cache.remove("clients", "c1", WriteSource::Local));
        assert!(store.get_record("clients", "c1").unwrap().is_none());
        assert_eq!(events.try_recv().unwrap().kind, CacheEventKind::Removed);
        assert!(!cache.has_cached_data());
    }

    #[test]
    fn test_reopen_restores_snapshot() {
        let store = Arc::new(MemoryStore::new());
        {
            let cache = CacheStore::open(Arc::new(DurableStore::new(store.clone()))).unwrap();
            cache.put(record("c1", "Acme", now_micros()), WriteSource::Remote);
            cache.put(record("c2", "Globex", now_micros()), WriteSource::Remote);
        }
        let cache = CacheStore::open(Arc::new(DurableStore::new(store))).unwrap();
        assert_eq!(cache.ids("clients"), vec!["c1".to_string(), "c2".to_string()]);
        assert!(cache.has_cached_data());
    }

    #[test]
    fn test_storage_info_counts() {
        let cache = cache();
        cache.put(record("c1", "Acme", now_micros()), WriteSource::Remote);
        cache.put(
            CachedRecord::new("tasks", "t1", json!({"id": "t1"}), now_micros()),
            WriteSource::Remote,
        );

        let info = cache.storage_info();
        assert_eq!(info.record_count(), 2);
        assert_eq!(info.table_counts.get("tasks"), Some(&1));
        assert!(info.total_bytes > 0);
        assert!(!info.memory_only);
        assert_eq!(info.durable_bytes, None);
    }

    #[test]
    fn test_snapshot_export_import() {
        let source = cache();
        source.put(record("c1", "Acme", now_micros()), WriteSource::Remote);
        source.put(record("c2", "Globex", now_micros()), WriteSource::Remote);
        let snapshot = source.export_snapshot();

        let target = cache();
        assert_eq!(target.import_snapshot(snapshot.clone()).unwrap(), 2);
        assert_eq!(target.export_snapshot(), snapshot);
    }

    #[test]
    fn test_import_rejects_rows_without_id() {
        let cache = cache();
        let mut snapshot = Snapshot::new();
        snapshot.insert("clients".to_string(), vec![json!({"name": "no id"})]);
        assert!(matches!(
            cache.import_snapshot(snapshot),
            Err(SyncError::MalformedRecord(_))
        ));
        assert!(!cache.has_cached_data());
    }

    #[test]
    fn test_meta_survives_in_store() {
        let store = Arc::new(MemoryStore::new());
        let durable = Arc::new(DurableStore::new(store.clone()));
        let cache = CacheStore::open(durable.clone()).unwrap();
        let meta = TableMeta {
            table: "clients".to_string(),
            last_synced_at: now_micros(),
            last_modified_at: now_micros(),
        };
        cache.set_meta(meta.clone());

        let reopened = CacheStore::open(durable).unwrap();
        assert_eq!(reopened.meta("clients"), Some(meta));

        reopened.clear_meta();
        assert_eq!(reopened.meta("clients"), None);
    }
}
