//! Core types for the offline sync core

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Record identifier within a table
pub type RecordId = String;

/// Current time truncated to the microsecond precision the store keeps
pub fn now_micros() -> DateTime<Utc> {
    use chrono::SubsecRound;
    Utc::now().trunc_subsecs(6)
}

/// A row mirrored from a remote table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord {
    pub table: String,
    pub id: RecordId,
    pub payload: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl CachedRecord {
    pub fn new(
        table: impl Into<String>,
        id: impl Into<RecordId>,
        payload: serde_json::Value,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
            payload,
            updated_at,
        }
    }

    /// Approximate byte footprint used for storage accounting
    pub fn byte_size(&self) -> u64 {
        let payload_len = serde_json::to_vec(&self.payload)
            .map(|v| v.len())
            .unwrap_or(0);
        (self.table.len() + self.id.len() + payload_len) as u64
    }
}

/// Extract a record id from a payload's `id` field.
///
/// String ids are taken as-is and integer ids are stringified. Anything else
/// is treated as missing.
pub fn payload_id(payload: &serde_json::Value) -> Option<RecordId> {
    match payload.get("id")? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
        _ => None,
    }
}

/// Parse a timestamp column from a payload (RFC 3339, with or without offset)
pub fn payload_timestamp(payload: &serde_json::Value, field: &str) -> Option<DateTime<Utc>> {
    use chrono::SubsecRound;

    let raw = payload.get(field)?.as_str()?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc).trunc_subsecs(6));
    }
    // Postgres `timestamp without time zone` renders without an offset
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| naive.and_utc().trunc_subsecs(6))
        .ok()
}

/// Kind of mutation carried by a queued change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Insert => "insert",
            ChangeOperation::Update => "update",
            ChangeOperation::Delete => "delete",
        }
    }
}

impl std::str::FromStr for ChangeOperation {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "insert" | "create" => Ok(ChangeOperation::Insert),
            "update" => Ok(ChangeOperation::Update),
            "delete" => Ok(ChangeOperation::Delete),
            _ => Err(SyncError::InvalidInput(format!(
                "Unknown change operation: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a change queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueEntryId(pub Uuid);

impl QueueEntryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for QueueEntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueueEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for QueueEntryId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| SyncError::InvalidInput(format!("Invalid queue entry id '{}': {}", s, e)))
    }
}

/// Lifecycle state of a queued change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeState {
    /// Waiting to be pushed (possibly backing off)
    Pending,
    /// Exhausted retries or was rejected; needs attention
    DeadLetter,
}

impl ChangeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeState::Pending => "pending",
            ChangeState::DeadLetter => "dead_letter",
        }
    }
}

impl std::str::FromStr for ChangeState {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ChangeState::Pending),
            "dead_letter" => Ok(ChangeState::DeadLetter),
            _ => Err(SyncError::InvalidInput(format!("Unknown change state: {}", s))),
        }
    }
}

/// A local mutation not yet acknowledged by the remote backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedChange {
    pub id: QueueEntryId,
    /// Global FIFO position
    pub seq: u64,
    pub table: String,
    pub record_id: RecordId,
    pub operation: ChangeOperation,
    pub payload: serde_json::Value,
    pub queued_at: DateTime<Utc>,
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub state: ChangeState,
    pub last_error: Option<String>,
}

impl QueuedChange {
    pub fn is_pending(&self) -> bool {
        self.state == ChangeState::Pending
    }

    pub fn is_dead_letter(&self) -> bool {
        self.state == ChangeState::DeadLetter
    }

    /// Whether the entry's backoff window has elapsed
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// Snapshot of sync state broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub pending_changes: usize,
    pub dead_letters: usize,
    pub storage_degraded: bool,
    pub error: Option<String>,
}

/// A table registered for synchronization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTable {
    pub name: String,
    /// Whether the remote table has an `updated_at` column usable for
    /// incremental pulls
    #[serde(default = "default_true")]
    pub has_updated_at: bool,
}

impl SyncTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            has_updated_at: true,
        }
    }

    pub fn without_updated_at(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            has_updated_at: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// The CRM tables mirrored offline
pub fn default_tables() -> Vec<SyncTable> {
    vec![
        SyncTable::new("clients"),
        SyncTable::new("projects"),
        SyncTable::new("tasks"),
        SyncTable::new("meetings"),
        SyncTable::new("time_entries"),
        SyncTable::new("documents"),
        SyncTable::new("quotes"),
        SyncTable::new("contracts"),
        SyncTable::new("invoices"),
        SyncTable::without_updated_at("reminders"),
    ]
}

/// Per-table staleness marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    pub table: String,
    pub last_synced_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}

/// Storage usage summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub table_counts: BTreeMap<String, usize>,
    /// Bytes held by cached records (table + id + serialized payload)
    pub total_bytes: u64,
    /// On-disk size of the durable store, if it has one
    pub durable_bytes: Option<u64>,
    pub quota_bytes: Option<u64>,
    pub memory_only: bool,
}

impl StorageInfo {
    pub fn record_count(&self) -> usize {
        self.table_counts.values().sum()
    }
}

/// All cached tables, keyed by table name (backup/restore format)
pub type Snapshot = BTreeMap<String, Vec<serde_json::Value>>;

/// How a sync pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Pass ran to the end (possibly with per-table or per-change failures)
    Completed,
    /// Another pass was already in flight
    Coalesced,
    /// No connectivity; nothing attempted
    Offline,
    /// Pass aborted on a network failure or timeout
    Failed,
}

/// Result of a sync pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    pub tables_pulled: usize,
    pub tables_failed: usize,
    pub records_pulled: usize,
    pub records_skipped: usize,
    pub changes_pushed: usize,
    pub changes_failed: usize,
    pub changes_dead_lettered: usize,
    pub errors: Vec<String>,
}

impl SyncReport {
    pub fn new(outcome: SyncOutcome) -> Self {
        Self {
            outcome,
            tables_pulled: 0,
            tables_failed: 0,
            records_pulled: 0,
            records_skipped: 0,
            changes_pushed: 0,
            changes_failed: 0,
            changes_dead_lettered: 0,
            errors: Vec::new(),
        }
    }

    /// True when the pass completed without any recorded error
    pub fn is_success(&self) -> bool {
        self.outcome == SyncOutcome::Completed && self.errors.is_empty()
    }
}
