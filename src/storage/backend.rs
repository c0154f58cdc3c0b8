//! Local store trait for abstracting durable cache implementations
//!
//! `LocalStore` is the opaque collaborator the cache and the change queue
//! persist through: records addressed by `(table, id)`, the queue log, and
//! per-table sync metadata. SQLite backs it in production; `MemoryStore`
//! stands in for tests and for ephemeral sessions.
//!
//! All methods are synchronous and take `&self`, so implementations manage
//! their own interior mutability.

use std::collections::HashMap;
use std::time::Instant;

use crate::error::Result;
use crate::types::{CachedRecord, QueueEntryId, QueuedChange, TableMeta};

/// Health status of a local store
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub latency_ms: f64,
    pub error: Option<String>,
    pub details: HashMap<String, String>,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            healthy: true,
            latency_ms: 0.0,
            error: None,
            details: HashMap::new(),
        }
    }
}

/// Durable key-value storage for cached rows, queued changes and metadata
pub trait LocalStore: Send + Sync {
    /// Short name for logs (`sqlite-wal`, `memory`, ...)
    fn kind(&self) -> &'static str;

    // ========================================================================
    // Records
    // ========================================================================

    /// Insert or replace records
    fn put_records(&self, records: &[CachedRecord]) -> Result<()>;

    /// Insert or replace a single record
    fn put_record(&self, record: &CachedRecord) -> Result<()> {
        self.put_records(std::slice::from_ref(record))
    }

    fn get_record(&self, table: &str, id: &str) -> Result<Option<CachedRecord>>;

    /// Enumerate every record of a table
    fn load_records(&self, table: &str) -> Result<Vec<CachedRecord>>;

    /// Tables holding at least one record
    fn tables(&self) -> Result<Vec<String>>;

    /// Returns whether a record was removed
    fn delete_record(&self, table: &str, id: &str) -> Result<bool>;

    /// Returns the number of records removed
    fn clear_table(&self, table: &str) -> Result<usize>;

    // ========================================================================
    // Change queue
    // ========================================================================

    /// Insert or replace a queue entry
    fn save_change(&self, change: &QueuedChange) -> Result<()>;

    fn delete_change(&self, id: QueueEntryId) -> Result<bool>;

    /// All queue entries in FIFO (`seq`) order
    fn load_changes(&self) -> Result<Vec<QueuedChange>>;

    // ========================================================================
    // Sync metadata
    // ========================================================================

    fn get_meta(&self, table: &str) -> Result<Option<TableMeta>>;

    fn set_meta(&self, meta: &TableMeta) -> Result<()>;

    fn clear_meta(&self) -> Result<()>;

    // ========================================================================
    // Staleness
    // ========================================================================

    /// Flag the persisted contents as untrustworthy (a removal failed and the
    /// store may still hold rows the session already dropped)
    fn set_invalidated(&self, _invalidated: bool) -> Result<()> {
        Ok(())
    }

    fn is_invalidated(&self) -> Result<bool> {
        Ok(false)
    }

    // ========================================================================
    // Housekeeping
    // ========================================================================

    /// On-disk footprint, if the store has one
    fn size_bytes(&self) -> Result<Option<u64>>;

    /// Configured quota, if any
    fn quota_bytes(&self) -> Option<u64> {
        None
    }

    /// Check store health with a cheap round trip
    fn health_check(&self) -> HealthStatus {
        let start = Instant::now();
        match self.tables() {
            Ok(tables) => {
                let mut status = HealthStatus {
                    latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                    ..Default::default()
                };
                status
                    .details
                    .insert("tables".to_string(), tables.len().to_string());
                status
                    .details
                    .insert("kind".to_string(), self.kind().to_string());
                status
            }
            Err(e) => HealthStatus {
                healthy: false,
                latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                error: Some(e.to_string()),
                details: HashMap::new(),
            },
        }
    }
}
