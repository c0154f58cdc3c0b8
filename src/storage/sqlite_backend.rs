//! SQLite implementation of the `LocalStore` trait
//!
//! Wraps `Storage` and delegates to the functions in `queries.rs`. Record
//! batches are written in a single transaction.

use crate::error::Result;
use crate::types::{CachedRecord, QueueEntryId, QueuedChange, TableMeta};

use super::backend::LocalStore;
use super::connection::{Storage, StorageOptions};
use super::queries;
use crate::config::StorageMode;

/// SQLite-backed local store
pub struct SqliteStore {
    storage: Storage,
}

impl SqliteStore {
    pub fn open(options: StorageOptions) -> Result<Self> {
        let storage = Storage::open(options)?;
        if let Some(warning) = storage.storage_mode_warning() {
            tracing::warn!("{}", warning);
        }
        Ok(Self { storage })
    }

    /// In-memory SQLite store (useful for testing)
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            storage: Storage::open_in_memory()?,
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

impl LocalStore for SqliteStore {
    fn kind(&self) -> &'static str {
        match self.storage.storage_mode() {
            StorageMode::Local => "sqlite-wal",
            StorageMode::CloudSafe => "sqlite-delete",
        }
    }

    fn put_records(&self, records: &[CachedRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.storage
            .with_transaction(|conn| queries::upsert_records(conn, records))
    }

    fn get_record(&self, table: &str, id: &str) -> Result<Option<CachedRecord>> {
        self.storage
            .with_connection(|conn| queries::get_record(conn, table, id))
    }

    fn load_records(&self, table: &str) -> Result<Vec<CachedRecord>> {
        self.storage
            .with_connection(|conn| queries::list_records(conn, table))
    }

    fn tables(&self) -> Result<Vec<String>> {
        self.storage.with_connection(queries::list_tables)
    }

    fn delete_record(&self, table: &str, id: &str) -> Result<bool> {
        self.storage
            .with_connection(|conn| queries::delete_record(conn, table, id))
    }

    fn clear_table(&self, table: &str) -> Result<usize> {
        self.storage
            .with_connection(|conn| queries::clear_records(conn, table))
    }

    fn save_change(&self, change: &QueuedChange) -> Result<()> {
        self.storage
            .with_connection(|conn| queries::save_change(conn, change))
    }

    fn delete_change(&self, id: QueueEntryId) -> Result<bool> {
        self.storage
            .with_connection(|conn| queries::delete_change(conn, id))
    }

    fn load_changes(&self) -> Result<Vec<QueuedChange>> {
        self.storage.with_connection(queries::load_changes)
    }

    fn get_meta(&self, table: &str) -> Result<Option<TableMeta>> {
        self.storage
            .with_connection(|conn| queries::get_meta(conn, table))
    }

    fn set_meta(&self, meta: &TableMeta) -> Result<()> {
        self.storage
            .with_connection(|conn| queries::set_meta(conn, meta))
    }

    fn clear_meta(&self) -> Result<()> {
        self.storage.with_connection(queries::clear_meta)
    }

    fn set_invalidated(&self, invalidated: bool) -> Result<()> {
        self.storage
            .with_connection(|conn| queries::set_invalidated(conn, invalidated))
    }

    fn is_invalidated(&self) -> Result<bool> {
        self.storage.with_connection(queries::is_invalidated)
    }

    fn size_bytes(&self) -> Result<Option<u64>> {
        self.storage.db_size().map(Some)
    }

    fn quota_bytes(&self) -> Option<u64> {
        self.storage.quota_bytes()
    }
}
