//! Cache write events
//!
//! Every mutation of the cache is published on a broadcast channel so that
//! observers (UI bindings, cross-device relays, tests) can follow writes
//! without wrapping or patching the store itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::RecordId;

/// Where a cache write came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteSource {
    /// Optimistic local mutation
    Local,
    /// Pulled from the remote backend
    Remote,
    /// Imported from a snapshot
    Restore,
}

/// Types of cache events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheEventKind {
    Upserted,
    Removed,
    TableCleared,
}

/// A cache write event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEvent {
    #[serde(rename = "type")]
    pub kind: CacheEventKind,
    pub table: String,
    /// Affected record (absent for table-wide events)
    pub record_id: Option<RecordId>,
    pub source: WriteSource,
    /// Whether the write reached durable storage
    pub persisted: bool,
    pub timestamp: DateTime<Utc>,
}

impl CacheEvent {
    pub fn upserted(table: &str, id: &str, source: WriteSource, persisted: bool) -> Self {
        Self {
            kind: CacheEventKind::Upserted,
            table: table.to_string(),
            record_id: Some(id.to_string()),
            source,
            persisted,
            timestamp: Utc::now(),
        }
    }

    pub fn removed(table: &str, id: &str, source: WriteSource, persisted: bool) -> Self {
        Self {
            kind: CacheEventKind::Removed,
            table: table.to_string(),
            record_id: Some(id.to_string()),
            source,
            persisted,
            timestamp: Utc::now(),
        }
    }

    pub fn table_cleared(table: &str, source: WriteSource, persisted: bool) -> Self {
        Self {
            kind: CacheEventKind::TableCleared,
            table: table.to_string(),
            record_id: None,
            source,
            persisted,
            timestamp: Utc::now(),
        }
    }
}

/// Subscription filter for cache events
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// Only events for these tables
    pub tables: Option<Vec<String>>,
    /// Only events from these sources
    pub sources: Option<Vec<WriteSource>>,
}

impl EventFilter {
    /// Check if an event matches this filter
    pub fn matches(&self, event: &CacheEvent) -> bool {
        if let Some(ref tables) = self.tables {
            if !tables.iter().any(|t| t == &event.table) {
                return false;
            }
        }

        if let Some(ref sources) = self.sources {
            if !sources.contains(&event.source) {
                return false;
            }
        }

        true
    }
}
