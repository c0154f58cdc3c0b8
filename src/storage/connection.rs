//! SQLite connection management with WAL mode support
//!
//! Opens the cache file with pragmas matching the storage mode and applies
//! the optional size quota through `max_page_count`.

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::Arc;

use super::migrations::run_migrations;
use crate::config::{StorageMode, SyncConfig};
use crate::error::Result;

/// Options for opening the cache database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageOptions {
    pub db_path: String,
    pub storage_mode: StorageMode,
    pub quota_bytes: Option<u64>,
}

impl From<&SyncConfig> for StorageOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            db_path: config.expanded_db_path(),
            storage_mode: config.storage_mode,
            quota_bytes: config.quota_bytes,
        }
    }
}

impl StorageOptions {
    pub fn in_memory() -> Self {
        Self {
            db_path: ":memory:".to_string(),
            storage_mode: StorageMode::Local,
            quota_bytes: None,
        }
    }
}

/// SQLite handle shared by the store
pub struct Storage {
    options: StorageOptions,
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open or create a database with the given options
    pub fn open(options: StorageOptions) -> Result<Self> {
        let conn = Self::create_connection(&options)?;

        run_migrations(&conn)?;

        if let Some(quota) = options.quota_bytes {
            Self::apply_quota(&conn, quota)?;
        }

        Ok(Self {
            options,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::open(StorageOptions::in_memory())
    }

    fn create_connection(options: &StorageOptions) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = if options.db_path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(&options.db_path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open_with_flags(&options.db_path, flags)?
        };

        Self::configure_pragmas(&conn, options.storage_mode)?;

        Ok(conn)
    }

    /// Local mode: WAL for throughput and crash recovery.
    /// Cloud-safe mode: DELETE journal so the file is self-contained.
    fn configure_pragmas(conn: &Connection, mode: StorageMode) -> Result<()> {
        match mode {
            StorageMode::Local => {
                conn.execute_batch(
                    r#"
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA wal_autocheckpoint=1000;
                    PRAGMA busy_timeout=30000;
                    PRAGMA temp_store=MEMORY;
                    PRAGMA foreign_keys=ON;
                    "#,
                )?;
            }
            StorageMode::CloudSafe => {
                conn.execute_batch(
                    r#"
                    PRAGMA journal_mode=DELETE;
                    PRAGMA synchronous=FULL;
                    PRAGMA busy_timeout=30000;
                    PRAGMA temp_store=MEMORY;
                    PRAGMA foreign_keys=ON;
                    "#,
                )?;
            }
        }
        Ok(())
    }

    /// Cap the file size; writes past the cap fail with `SQLITE_FULL`
    fn apply_quota(conn: &Connection, quota_bytes: u64) -> Result<()> {
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        let pages = (quota_bytes as i64 / page_size.max(1)).max(1);
        let applied: i64 =
            conn.query_row(&format!("PRAGMA max_page_count = {}", pages), [], |row| {
                row.get(0)
            })?;
        tracing::debug!("Cache quota: {} bytes ({} pages)", quota_bytes, applied);
        Ok(())
    }

    /// Execute a function with the connection
    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Execute a function with a transaction
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.options.storage_mode
    }

    pub fn db_path(&self) -> &str {
        &self.options.db_path
    }

    pub fn quota_bytes(&self) -> Option<u64> {
        self.options.quota_bytes
    }

    /// Check if the database sits in a cloud-synced folder
    pub fn is_in_cloud_folder(&self) -> bool {
        let path = self.options.db_path.to_lowercase();
        path.contains("dropbox")
            || path.contains("onedrive")
            || path.contains("icloud")
            || path.contains("google drive")
    }

    /// Warning if the storage mode doesn't match the folder type
    pub fn storage_mode_warning(&self) -> Option<String> {
        if self.is_in_cloud_folder() && self.options.storage_mode == StorageMode::Local {
            Some(format!(
                "Cache '{}' appears to be in a cloud-synced folder; WAL mode may corrupt it. \
                 Set TENARCH_STORAGE_MODE=cloud-safe or move the cache to a local folder.",
                self.options.db_path
            ))
        } else {
            None
        }
    }

    /// Database size in bytes
    pub fn db_size(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let size: i64 = conn.query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )?;
        Ok(size.max(0) as u64)
    }

    /// Checkpoint the WAL file (local mode only)
    pub fn checkpoint(&self) -> Result<()> {
        if self.options.storage_mode == StorageMode::Local {
            let conn = self.conn.lock();
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        }
        Ok(())
    }
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            options: self.options.clone(),
            conn: self.conn.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory() {
        let storage = Storage::open_in_memory().unwrap();
        assert_eq!(storage.db_path(), ":memory:");
        assert!(storage.db_size().unwrap() > 0);
    }

    #[test]
    fn test_storage_modes() {
        for mode in [StorageMode::Local, StorageMode::CloudSafe] {
            let storage = Storage::open(StorageOptions {
                storage_mode: mode,
                ..StorageOptions::in_memory()
            })
            .unwrap();
            assert_eq!(storage.storage_mode(), mode);
        }
    }

    #[test]
    fn test_cloud_folder_warning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Dropbox").join("offline.db");
        let storage = Storage::open(StorageOptions {
            db_path: path.to_string_lossy().to_string(),
            storage_mode: StorageMode::Local,
            quota_bytes: None,
        })
        .unwrap();
        assert!(storage.is_in_cloud_folder());
        assert!(storage.storage_mode_warning().is_some());
    }

    #[test]
    fn test_file_database_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.db");
        let storage = Storage::open(StorageOptions {
            db_path: path.to_string_lossy().to_string(),
            storage_mode: StorageMode::Local,
            quota_bytes: None,
        })
        .unwrap();
        storage.checkpoint().unwrap();
        assert!(path.exists());
    }
}
