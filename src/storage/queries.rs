//! SQL queries for cached records, the change queue, and sync metadata

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, SyncError};
use crate::types::{CachedRecord, QueueEntryId, QueuedChange, TableMeta};

/// Fixed-width RFC 3339 so lexical order matches time order
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::Storage(format!("Invalid stored timestamp '{}': {}", raw, e)))
}

fn parse_optional_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

// ============================================================================
// Records
// ============================================================================

type RawRecord = (String, String, String, String);

fn record_from_raw((table, id, payload, updated_at): RawRecord) -> Result<CachedRecord> {
    Ok(CachedRecord {
        table,
        id,
        payload: serde_json::from_str(&payload)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

/// Insert or replace records
pub fn upsert_records(conn: &Connection, records: &[CachedRecord]) -> Result<()> {
    let now = format_ts(&Utc::now());
    let mut stmt = conn.prepare_cached(
        "INSERT INTO cached_records (table_name, id, payload, updated_at, local_updated_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(table_name, id) DO UPDATE SET
            payload = excluded.payload,
            updated_at = excluded.updated_at,
            local_updated_at = excluded.local_updated_at",
    )?;

    for record in records {
        stmt.execute(params![
            record.table,
            record.id,
            record.payload.to_string(),
            format_ts(&record.updated_at),
            now,
        ])?;
    }
    Ok(())
}

pub fn get_record(conn: &Connection, table: &str, id: &str) -> Result<Option<CachedRecord>> {
    let raw: Option<RawRecord> = conn
        .query_row(
            "SELECT table_name, id, payload, updated_at FROM cached_records
             WHERE table_name = ? AND id = ?",
            params![table, id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;

    raw.map(record_from_raw).transpose()
}

pub fn list_records(conn: &Connection, table: &str) -> Result<Vec<CachedRecord>> {
    let mut stmt = conn.prepare(
        "SELECT table_name, id, payload, updated_at FROM cached_records
         WHERE table_name = ? ORDER BY id",
    )?;
    let rows = stmt.query_map(params![table], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
    })?;

    let mut records = Vec::new();
    for raw in rows {
        records.push(record_from_raw(raw?)?);
    }
    Ok(records)
}

pub fn list_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT DISTINCT table_name FROM cached_records ORDER BY table_name")?;
    let tables = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(tables)
}

pub fn delete_record(conn: &Connection, table: &str, id: &str) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM cached_records WHERE table_name = ? AND id = ?",
        params![table, id],
    )?;
    Ok(deleted > 0)
}

pub fn clear_records(conn: &Connection, table: &str) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM cached_records WHERE table_name = ?",
        params![table],
    )?;
    Ok(deleted)
}

// ============================================================================
// Change queue
// ============================================================================

/// Insert or replace a queue entry
pub fn save_change(conn: &Connection, change: &QueuedChange) -> Result<()> {
    conn.execute(
        "INSERT INTO change_queue
            (id, seq, table_name, record_id, operation, payload, queued_at,
             attempts, next_attempt_at, state, last_error)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            attempts = excluded.attempts,
            next_attempt_at = excluded.next_attempt_at,
            state = excluded.state,
            last_error = excluded.last_error,
            payload = excluded.payload",
        params![
            change.id.to_string(),
            change.seq as i64,
            change.table,
            change.record_id,
            change.operation.as_str(),
            change.payload.to_string(),
            format_ts(&change.queued_at),
            change.attempts,
            change.next_attempt_at.as_ref().map(format_ts),
            change.state.as_str(),
            change.last_error,
        ],
    )?;
    Ok(())
}

pub fn delete_change(conn: &Connection, id: QueueEntryId) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM change_queue WHERE id = ?",
        params![id.to_string()],
    )?;
    Ok(deleted > 0)
}

/// All queue entries in FIFO order
pub fn load_changes(conn: &Connection) -> Result<Vec<QueuedChange>> {
    let mut stmt = conn.prepare(
        "SELECT id, seq, table_name, record_id, operation, payload, queued_at,
                attempts, next_attempt_at, state, last_error
         FROM change_queue ORDER BY seq",
    )?;

    #[allow(clippy::type_complexity)]
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, String>(6)?,
            row.get::<_, u32>(7)?,
            row.get::<_, Option<String>>(8)?,
            row.get::<_, String>(9)?,
            row.get::<_, Option<String>>(10)?,
        ))
    })?;

    let mut changes = Vec::new();
    for row in rows {
        let (
            id,
            seq,
            table,
            record_id,
            operation,
            payload,
            queued_at,
            attempts,
            next_attempt_at,
            state,
            last_error,
        ) = row?;

        changes.push(QueuedChange {
            id: id.parse()?,
            seq: seq.max(0) as u64,
            table,
            record_id,
            operation: operation.parse()?,
            payload: serde_json::from_str(&payload)?,
            queued_at: parse_ts(&queued_at)?,
            attempts,
            next_attempt_at: parse_optional_ts(next_attempt_at)?,
            state: state.parse()?,
            last_error,
        });
    }
    Ok(changes)
}

// ============================================================================
// Sync metadata
// ============================================================================

pub fn get_meta(conn: &Connection, table: &str) -> Result<Option<TableMeta>> {
    let raw: Option<(String, String, String)> = conn
        .query_row(
            "SELECT table_name, last_synced_at, last_modified_at FROM sync_meta
             WHERE table_name = ?",
            params![table],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    raw.map(|(table, synced, modified)| {
        Ok(TableMeta {
            table,
            last_synced_at: parse_ts(&synced)?,
            last_modified_at: parse_ts(&modified)?,
        })
    })
    .transpose()
}

pub fn set_meta(conn: &Connection, meta: &TableMeta) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_meta (table_name, last_synced_at, last_modified_at)
         VALUES (?, ?, ?)
         ON CONFLICT(table_name) DO UPDATE SET
            last_synced_at = excluded.last_synced_at,
            last_modified_at = excluded.last_modified_at",
        params![
            meta.table,
            format_ts(&meta.last_synced_at),
            format_ts(&meta.last_modified_at),
        ],
    )?;
    Ok(())
}

pub fn clear_meta(conn: &Connection) -> Result<()> {
    conn.execute("DELETE FROM sync_meta", [])?;
    Ok(())
}

/// `user_version` value marking the file's contents as stale
const STALE_MARKER: i64 = 1;

/// Stored in the header page, so it can be set even when the file is full
pub fn set_invalidated(conn: &Connection, invalidated: bool) -> Result<()> {
    let value = if invalidated { STALE_MARKER } else { 0 };
    conn.execute_batch(&format!("PRAGMA user_version = {}", value))?;
    Ok(())
}

pub fn is_invalidated(conn: &Connection) -> Result<bool> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version == STALE_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrations::run_migrations;
    use crate::types::{ChangeOperation, ChangeState};
    use serde_json::json;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn test_record_upsert_and_list() {
        let conn = conn();
        let now = Utc::now();
        let a = CachedRecord::new("clients", "a", json!({"id": "a", "name": "Acme"}), now);
        let b = CachedRecord::new("clients", "b", json!({"id": "b"}), now);
        upsert_records(&conn, &[a.clone(), b]).unwrap();

        let updated = CachedRecord::new("clients", "a", json!({"id": "a", "name": "Acme 2"}), now);
        upsert_records(&conn, &[updated.clone()]).unwrap();

        let loaded = get_record(&conn, "clients", "a").unwrap().unwrap();
        assert_eq!(loaded.payload, updated.payload);
        assert_eq!(list_records(&conn, "clients").unwrap().len(), 2);
        assert_eq!(list_tables(&conn).unwrap(), vec!["clients".to_string()]);

        assert!(delete_record(&conn, "clients", "a").unwrap());
        assert!(!delete_record(&conn, "clients", "a").unwrap());
        assert_eq!(clear_records(&conn, "clients").unwrap(), 1);
    }

    #[test]
    fn test_change_queue_persists_in_seq_order() {
        let conn = conn();
        let now = Utc::now();
        let mut changes: Vec<QueuedChange> = (0..3)
            .rev()
            .map(|seq| QueuedChange {
                id: QueueEntryId::new(),
                seq,
                table: "tasks".to_string(),
                record_id: format!("t{}", seq),
                operation: ChangeOperation::Insert,
                payload: json!({"id": format!("t{}", seq)}),
                queued_at: now,
                attempts: 0,
                next_attempt_at: None,
                state: ChangeState::Pending,
                last_error: None,
            })
            .collect();
        for change in &changes {
            save_change(&conn, change).unwrap();
        }

        changes[0].attempts = 2;
        changes[0].state = ChangeState::DeadLetter;
        changes[0].last_error = Some("rejected".to_string());
        save_change(&conn, &changes[0]).unwrap();

        let loaded = load_changes(&conn).unwrap();
        let seqs: Vec<u64> = loaded.iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        let dead = loaded.iter().find(|c| c.seq == 2).unwrap();
        assert_eq!(dead.state, ChangeState::DeadLetter);
        assert_eq!(dead.attempts, 2);

        assert!(delete_change(&conn, dead.id).unwrap());
        assert_eq!(load_changes(&conn).unwrap().len(), 2);
    }

    #[test]
    fn test_meta_round_trip() {
        let conn = conn();
        assert!(get_meta(&conn, "clients").unwrap().is_none());

        let meta = TableMeta {
            table: "clients".to_string(),
            last_synced_at: Utc::now(),
            last_modified_at: Utc::now(),
        };
        set_meta(&conn, &meta).unwrap();
        let loaded = get_meta(&conn, "clients").unwrap().unwrap();
        assert_eq!(
            format_ts(&loaded.last_synced_at),
            format_ts(&meta.last_synced_at)
        );

        clear_meta(&conn).unwrap();
        assert!(get_meta(&conn, "clients").unwrap().is_none());
    }

    #[test]
    fn test_stale_marker_round_trip() {
        let conn = conn();
        assert!(!is_invalidated(&conn).unwrap());
        set_invalidated(&conn, true).unwrap();
        assert!(is_invalidated(&conn).unwrap());
        set_invalidated(&conn, false).unwrap();
        assert!(!is_invalidated(&conn).unwrap());
    }
}
