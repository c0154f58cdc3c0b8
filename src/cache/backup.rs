//! Backup normalization
//!
//! Besides the cache's own `{table: [rows]}` export, restores accept the
//! CRM's other backup shapes:
//!
//! - `{ "data": { ... }, "metadata"|"statistics"|"categories": ... }`
//! - entity roots in PascalCase (`Client`, `TimeLog`, ...)
//! - camelCase roots (`timeLogs`, `timeEntries`, ...)
//! - snake_case roots (`clients`, `time_logs`, ...)
//!
//! Each is mapped onto table names and deduplicated into a `Snapshot`.

use std::collections::{BTreeMap, HashSet};

use serde_json::{Map, Value};

use crate::error::{Result, SyncError};
use crate::types::{payload_id, Snapshot};

/// Shape a backup file was recognized as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupFormat {
    /// Entities nested under a `data` object
    Wrapped,
    PascalCase,
    CamelCase,
    /// Table names at the root; includes the cache's own export
    SnakeCase,
}

impl BackupFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupFormat::Wrapped => "wrapped",
            BackupFormat::PascalCase => "pascal-case",
            BackupFormat::CamelCase => "camel-case",
            BackupFormat::SnakeCase => "snake-case",
        }
    }
}

impl std::fmt::Display for BackupFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// snake_case entity name to table
const ENTITY_TABLES: &[(&str, &str)] = &[
    ("client", "clients"),
    ("clients", "clients"),
    ("project", "projects"),
    ("projects", "projects"),
    ("task", "tasks"),
    ("tasks", "tasks"),
    ("meeting", "meetings"),
    ("meetings", "meetings"),
    ("time_log", "time_entries"),
    ("time_logs", "time_entries"),
    ("timelog", "time_entries"),
    ("timelogs", "time_entries"),
    ("time_entry", "time_entries"),
    ("time_entries", "time_entries"),
    ("document", "documents"),
    ("documents", "documents"),
    ("quote", "quotes"),
    ("quotes", "quotes"),
    ("contract", "contracts"),
    ("contracts", "contracts"),
    ("invoice", "invoices"),
    ("invoices", "invoices"),
    ("reminder", "reminders"),
    ("reminders", "reminders"),
];

/// Keys that describe a backup rather than hold rows
const ENVELOPE_KEYS: &[&str] = &[
    "data",
    "metadata",
    "statistics",
    "categories",
    "version",
    "exportDate",
    "export_date",
    "exported_at",
];

/// Parse backup text, tolerating a leading byte-order mark
pub fn parse_backup(text: &str) -> Result<Value> {
    let text = text.trim_start_matches('\u{feff}').trim();
    Ok(serde_json::from_str(text)?)
}

/// Recognize a backup's shape, if it has one
pub fn detect_format(value: &Value) -> Option<BackupFormat> {
    let root = value.as_object()?;
    if let Some(Value::Object(data)) = root.get("data") {
        return has_entities(data).then_some(BackupFormat::Wrapped);
    }
    if !has_entities(root) {
        return None;
    }

    let keys = || entity_keys(root);
    if keys().any(|k| k.starts_with(|c: char| c.is_ascii_uppercase())) {
        Some(BackupFormat::PascalCase)
    } else if keys().any(|k| k.contains(|c: char| c.is_ascii_uppercase())) {
        Some(BackupFormat::CamelCase)
    } else {
        Some(BackupFormat::SnakeCase)
    }
}

/// Map any supported backup shape onto a table snapshot.
///
/// Unrecognized entity keys in PascalCase or camelCase are dropped;
/// unrecognized snake_case keys are kept under their own name so exports of
/// custom tables restore unchanged.
pub fn normalize_backup(value: Value) -> Result<Snapshot> {
    let format = detect_format(&value).ok_or_else(|| unrecognized(&value))?;

    let Value::Object(mut root) = value else {
        return Err(unrecognized(&Value::Null));
    };
    let entities = match root.remove("data") {
        Some(Value::Object(data)) if format == BackupFormat::Wrapped => data,
        _ => root,
    };

    let mut tables: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for (key, rows) in entities {
        let Value::Array(rows) = rows else {
            continue;
        };
        match table_for_key(&key) {
            Some(table) => tables.entry(table).or_default().extend(rows),
            None => tracing::debug!("Ignoring {} entry {:?} in backup", format, key),
        }
    }

    let rows: usize = tables.values().map(Vec::len).sum();
    tracing::debug!(
        "Normalized {} backup: {} tables, {} rows",
        format,
        tables.len(),
        rows
    );
    Ok(merge_backups([tables]))
}

/// Combine snapshots, keeping the first copy of each row.
///
/// Rows are matched by `id`, then by `email`, then by their full content.
pub fn merge_backups<I>(snapshots: I) -> Snapshot
where
    I: IntoIterator<Item = Snapshot>,
{
    let mut merged = Snapshot::new();
    let mut seen: BTreeMap<String, HashSet<String>> = BTreeMap::new();

    for snapshot in snapshots {
        for (table, rows) in snapshot {
            let keys = seen.entry(table.clone()).or_default();
            let target = merged.entry(table).or_default();
            for row in rows {
                if keys.insert(dedup_key(&row)) {
                    target.push(row);
                }
            }
        }
    }
    merged
}

fn dedup_key(row: &Value) -> String {
    if let Some(id) = payload_id(row) {
        return format!("id:{}", id);
    }
    match row.get("email").and_then(Value::as_str) {
        Some(email) if !email.is_empty() => format!("email:{}", email.to_lowercase()),
        _ => format!("row:{}", row),
    }
}

fn has_entities(map: &Map<String, Value>) -> bool {
    entity_keys(map).next().is_some()
}

fn entity_keys(map: &Map<String, Value>) -> impl Iterator<Item = &str> + '_ {
    map.iter()
        .filter(|(key, value)| value.is_array() && table_for_key(key).is_some())
        .map(|(key, _)| key.as_str())
}

/// Table a backup key holds rows for
fn table_for_key(key: &str) -> Option<String> {
    if ENVELOPE_KEYS.contains(&key) {
        return None;
    }
    let snake = to_snake_case(key);
    if let Some((_, table)) = ENTITY_TABLES.iter().find(|(name, _)| *name == snake) {
        return Some((*table).to_string());
    }
    let is_identifier = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    is_identifier.then(|| key.to_string())
}

fn to_snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, c) in key.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn unrecognized(value: &Value) -> SyncError {
    let keys = value
        .as_object()
        .map(|root| root.keys().cloned().collect::<Vec<_>>().join(", "))
        .unwrap_or_default();
    if keys.is_empty() {
        SyncError::InvalidInput("unrecognized backup format: expected a JSON object of tables".into())
    } else {
        SyncError::InvalidInput(format!(
            "unrecognized backup format; found keys: {}",
            keys
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_detect_format() {
        assert_eq!(
            detect_format(&json!({"data": {"Client": []}, "metadata": {}})),
            Some(BackupFormat::Wrapped)
        );
        assert_eq!(
            detect_format(&json!({"Client": [], "TimeLog": []})),
            Some(BackupFormat::PascalCase)
        );
        assert_eq!(
            detect_format(&json!({"clients": [], "timeLogs": []})),
            Some(BackupFormat::CamelCase)
        );
        assert_eq!(
            detect_format(&json!({"clients": [], "time_logs": []})),
            Some(BackupFormat::SnakeCase)
        );
        assert_eq!(detect_format(&json!({"Widget": [], "version": 2})), None);
        assert_eq!(detect_format(&json!([1, 2])), None);
    }

    #[test]
    fn test_table_for_key() {
        assert_eq!(table_for_key("TimeLog").as_deref(), Some("time_entries"));
        assert_eq!(table_for_key("timeEntries").as_deref(), Some("time_entries"));
        assert_eq!(table_for_key("Invoice").as_deref(), Some("invoices"));
        assert_eq!(table_for_key("team_members").as_deref(), Some("team_members"));
        assert_eq!(table_for_key("TeamMember"), None);
        assert_eq!(table_for_key("categories"), None);
    }

    #[test]
    fn test_byte_order_mark_is_ignored() {
        let value = parse_backup("\u{feff}{\"clients\": []}").unwrap();
        assert_eq!(value, json!({"clients": []}));
    }

    #[test]
    fn test_unrecognized_backup_lists_keys() {
        let err = normalize_backup(json!({"Widget": [], "version": 2})).unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, SyncError::InvalidInput(_)));
        assert!(message.contains("Widget"));
        assert!(message.contains("version"));
    }

    #[test]
    fn test_merge_keeps_first_copy() {
        let first = normalize_backup(json!({
            "clients": [{"id": "c1", "name": "Acme"}, {"email": "a@x.io", "name": "Ann"}]
        }))
        .unwrap();
        let second = normalize_backup(json!({
            "Client": [
                {"id": "c1", "name": "Acme (old)"},
                {"id": "c2", "name": "Globex"},
                {"email": "A@x.io", "name": "Ann again"}
            ]
        }))
        .unwrap();

        let merged = merge_backups([first, second]);
        let names: Vec<_> = merged["clients"].iter().map(|r| r["name"].clone()).collect();
        assert_eq!(names, vec![json!("Acme"), json!("Ann"), json!("Globex")]);
    }
}
