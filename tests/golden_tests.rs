//! Golden tests - fixture-based tests that lock expected behavior
//!
//! These tests use JSON fixtures to verify how pulled rows are parsed and how
//! queued changes rewrite cached payloads. Any change in behavior will cause
//! these tests to fail, signaling a potential breaking change.
//!
//! Run with: cargo test --test golden_tests

use serde::Deserialize;
use std::fs;

// ============================================================================
// REMOTE ROW PARSING GOLDEN TESTS
// ============================================================================

mod remote_row_golden {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use tenarch_sync::sync::reconcile::parse_remote_row;
    use tenarch_sync::SyncTable;

    #[derive(Debug, Deserialize)]
    struct Parsed {
        id: String,
        updated_at: Option<DateTime<Utc>>,
    }

    #[derive(Debug, Deserialize)]
    struct TestCase {
        name: String,
        table: String,
        has_updated_at: bool,
        row: serde_json::Value,
        expected: Expected,
    }

    #[derive(Debug, Deserialize)]
    #[serde(untagged)]
    enum Expected {
        Ok { ok: Parsed },
        Err { err: String },
    }

    #[derive(Debug, Deserialize)]
    struct Fixture {
        test_cases: Vec<TestCase>,
    }

    #[test]
    fn test_remote_row_parsing_golden() {
        let fixture_path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/remote_rows.json");
        let content =
            fs::read_to_string(fixture_path).expect("Failed to read remote_rows.json fixture");
        let fixture: Fixture =
            serde_json::from_str(&content).expect("Failed to parse fixture JSON");

        let pulled_at = Utc.with_ymd_and_hms(2030, 6, 1, 12, 0, 0).unwrap();

        for case in fixture.test_cases {
            let table = SyncTable {
                name: case.table.clone(),
                has_updated_at: case.has_updated_at,
            };
            let result = parse_remote_row(&table, case.row.clone(), pulled_at);

            match case.expected {
                Expected::Ok { ok } => {
                    let parsed = match result {
                        Ok(parsed) => parsed,
                        Err(e) => panic!("Case '{}': expected Ok, got Err({})", case.name, e),
                    };
                    assert_eq!(parsed.record.id, ok.id, "Case '{}': id mismatch", case.name);
                    assert_eq!(parsed.record.table, case.table, "Case '{}'", case.name);
                    assert_eq!(
                        parsed.record.payload, case.row,
                        "Case '{}': payload must be kept verbatim",
                        case.name
                    );
                    assert_eq!(
                        parsed.has_timestamp,
                        ok.updated_at.is_some(),
                        "Case '{}': has_timestamp mismatch",
                        case.name
                    );
                    assert_eq!(
                        parsed.record.updated_at,
                        ok.updated_at.unwrap_or(pulled_at),
                        "Case '{}': updated_at mismatch",
                        case.name
                    );
                }
                Expected::Err { err } => {
                    let error = match result {
                        Ok(parsed) => panic!(
                            "Case '{}': expected Err containing {:?}, got Ok({:?})",
                            case.name, err, parsed.record
                        ),
                        Err(e) => e.to_string(),
                    };
                    assert!(
                        error.contains(&err),
                        "Case '{}': expected error containing {:?}, got {:?}",
                        case.name,
                        err,
                        error
                    );
                }
            }
        }
    }
}

// ============================================================================
// CHANGE APPLICATION GOLDEN TESTS
// ============================================================================

mod change_application_golden {
    use super::*;
    use serde_json::Value;
    use tenarch_sync::sync::reconcile::apply_change;
    use tenarch_sync::ChangeOperation;

    #[derive(Debug, Deserialize)]
    struct TestCase {
        name: String,
        current: Option<Value>,
        operation: ChangeOperation,
        payload: Value,
        expected: Option<Value>,
    }

    #[derive(Debug, Deserialize)]
    struct Fixture {
        test_cases: Vec<TestCase>,
    }

    #[test]
    fn test_change_application_golden() {
        let fixture_path = concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/tests/fixtures/change_application.json"
        );
        let content = fs::read_to_string(fixture_path)
            .expect("Failed to read change_application.json fixture");
        let fixture: Fixture =
            serde_json::from_str(&content).expect("Failed to parse fixture JSON");

        for case in fixture.test_cases {
            let result = apply_change(case.current.clone(), case.operation, &case.payload);
            assert_eq!(
                result, case.expected,
                "Case '{}': {} produced the wrong payload",
                case.name, case.operation
            );
        }
    }
}

// ============================================================================
// BACKUP FORMAT GOLDEN TESTS
// ============================================================================

mod backup_format_golden {
    use super::*;
    use serde_json::Value;
    use std::collections::BTreeMap;
    use tenarch_sync::{merge_backups, normalize_backup, payload_id};

    #[derive(Debug, Deserialize)]
    struct TestCase {
        name: String,
        inputs: Vec<Value>,
        expected: Expected,
    }

    #[derive(Debug, Deserialize)]
    #[serde(untagged)]
    enum Expected {
        Ok { ok: BTreeMap<String, Vec<String>> },
        Err { err: String },
    }

    #[derive(Debug, Deserialize)]
    struct Fixture {
        test_cases: Vec<TestCase>,
    }

    #[test]
    fn test_backup_formats_golden() {
        let fixture_path = concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/tests/fixtures/backup_formats.json"
        );
        let content =
            fs::read_to_string(fixture_path).expect("Failed to read backup_formats.json fixture");
        let fixture: Fixture =
            serde_json::from_str(&content).expect("Failed to parse fixture JSON");

        for case in fixture.test_cases {
            let result = case
                .inputs
                .into_iter()
                .map(normalize_backup)
                .collect::<Result<Vec<_>, _>>()
                .map(merge_backups);

            match case.expected {
                Expected::Ok { ok } => {
                    let snapshot = match result {
                        Ok(snapshot) => snapshot,
                        Err(e) => panic!("Case '{}': expected Ok, got Err({})", case.name, e),
                    };
                    let ids: BTreeMap<String, Vec<String>> = snapshot
                        .iter()
                        .map(|(table, rows)| {
                            (
                                table.clone(),
                                rows.iter().filter_map(payload_id).collect(),
                            )
                        })
                        .collect();
                    assert_eq!(ids, ok, "Case '{}': tables mismatch", case.name);
                }
                Expected::Err { err } => {
                    let error = match result {
                        Ok(snapshot) => panic!(
                            "Case '{}': expected Err containing {:?}, got Ok({:?})",
                            case.name, err, snapshot
                        ),
                        Err(e) => e.to_string(),
                    };
                    assert!(
                        error.contains(&err),
                        "Case '{}': expected error containing {:?}, got {:?}",
                        case.name,
                        err,
                        error
                    );
                }
            }
        }
    }
}
