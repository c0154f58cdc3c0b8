//! Reconciliation rules
//!
//! Pure functions shared by the engine: parsing pulled rows, deciding between
//! a remote row and pending local changes, and applying a queued mutation to
//! a record payload.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::cache::{CacheStore, WriteSource};
use crate::config::ConflictPolicy;
use crate::error::{Result, SyncError};
use crate::types::{
    payload_id, payload_timestamp, CachedRecord, ChangeOperation, QueuedChange, SyncTable,
};

/// A pulled row ready for the cache
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRow {
    pub record: CachedRecord,
    /// False when `updated_at` was missing and the pull time was used
    pub has_timestamp: bool,
}

/// Validate a pulled row.
///
/// Rows must be JSON objects with an `id`. A present but unparseable
/// `updated_at` is malformed on tables that track it; a missing one falls
/// back to `pulled_at`.
pub fn parse_remote_row(table: &SyncTable, row: Value, pulled_at: DateTime<Utc>) -> Result<RemoteRow> {
    if !row.is_object() {
        return Err(SyncError::MalformedRecord(format!(
            "{} row is not an object",
            table.name
        )));
    }

    let id = payload_id(&row).ok_or_else(|| {
        SyncError::MalformedRecord(format!("{} row has no usable id", table.name))
    })?;

    let stamp = match row.get("updated_at") {
        None | Some(Value::Null) => None,
        Some(_) => match payload_timestamp(&row, "updated_at") {
            Some(at) => Some(at),
            None if table.has_updated_at => {
                return Err(SyncError::MalformedRecord(format!(
                    "{} {} has an unreadable updated_at",
                    table.name, id
                )))
            }
            None => None,
        },
    };

    Ok(RemoteRow {
        record: CachedRecord::new(
            table.name.clone(),
            id,
            row,
            stamp.unwrap_or(pulled_at),
        ),
        has_timestamp: stamp.is_some(),
    })
}

/// Outcome of comparing a remote row with local state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// No pending local change: cache the remote row (subject to LWW)
    TakeRemote,
    /// Pending local changes win; the remote row is ignored
    KeepLocal,
    /// The remote row is newer than the pending changes, which are dropped
    /// to the dead-letter state
    SupersedeLocal,
}

/// Decide how a pulled row interacts with pending changes to the same record
pub fn resolve(
    policy: ConflictPolicy,
    remote: &RemoteRow,
    pending: &[QueuedChange],
    cached: Option<&CachedRecord>,
) -> Resolution {
    let Some(last) = pending.last() else {
        return Resolution::TakeRemote;
    };

    match policy {
        ConflictPolicy::PreferLocal => Resolution::KeepLocal,
        ConflictPolicy::LastWriterWins => {
            if !remote.has_timestamp {
                return Resolution::KeepLocal;
            }
            let local_at = cached.map(|c| c.updated_at).unwrap_or(last.queued_at);
            if remote.record.updated_at > local_at {
                Resolution::SupersedeLocal
            } else {
                Resolution::KeepLocal
            }
        }
    }
}

/// Apply one mutation to a record payload. `None` means the record is gone.
pub fn apply_change(current: Option<Value>, operation: ChangeOperation, payload: &Value) -> Option<Value> {
    match operation {
        ChangeOperation::Insert => Some(payload.clone()),
        ChangeOperation::Update => match (current, payload.as_object()) {
            (Some(Value::Object(mut base)), Some(patch)) => {
                for (key, value) in patch {
                    base.insert(key.clone(), value.clone());
                }
                Some(Value::Object(base))
            }
            _ => Some(payload.clone()),
        },
        ChangeOperation::Delete => None,
    }
}

/// Replay queued changes, in order, onto a cache
pub fn replay(cache: &CacheStore, changes: &[QueuedChange]) {
    for change in changes {
        let current = cache
            .get_item(&change.table, &change.record_id)
            .map(|r| r.payload);
        let stamp = cache.next_local_timestamp(&change.table, &change.record_id);

        match apply_change(current, change.operation, &change.payload) {
            Some(payload) => {
                cache.put(
                    CachedRecord::new(change.table.clone(), change.record_id.clone(), payload, stamp),
                    WriteSource::Local,
                );
            }
            None => {
                cache.remove(&change.table, &change.record_id, WriteSource::Local);
            }
        }
    }
}
