//! Property-based tests for tenarch-sync
//!
//! These tests verify invariants that must hold for all inputs:
//! - Parsers never panic
//! - Replaying the queue reproduces the local view
//! - The cache never moves a record backwards in time
//! - Bounded operations stay bounded
//!
//! Run with: cargo test --test property_tests

use proptest::prelude::*;

// ============================================================================
// PAYLOAD PARSING TESTS
// ============================================================================

mod payload_tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};
    use tenarch_sync::sync::reconcile::parse_remote_row;
    use tenarch_sync::{payload_id, payload_timestamp, SyncTable};

    fn id_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            ".*".prop_map(Value::String),
            any::<i64>().prop_map(|n| json!(n)),
            any::<f64>().prop_map(|f| json!(f)),
            any::<bool>().prop_map(Value::Bool),
            Just(Value::Null),
        ]
    }

    proptest! {
        /// Invariant: payload_id never panics on any id value
        #[test]
        fn payload_id_never_panics(id in id_value()) {
            let _ = payload_id(&json!({ "id": id }));
        }

        /// Invariant: Non-blank string ids come back unchanged
        #[test]
        fn string_ids_preserved(id in "[A-Za-z0-9_-]{1,40}") {
            prop_assert_eq!(payload_id(&json!({ "id": id.clone() })), Some(id));
        }

        /// Invariant: Integer ids are stringified
        #[test]
        fn integer_ids_stringified(n in any::<i64>()) {
            prop_assert_eq!(payload_id(&json!({ "id": n })), Some(n.to_string()));
        }

        /// Invariant: payload_timestamp never panics on any string
        #[test]
        fn timestamp_never_panics(s in "\\PC{0,40}") {
            let _ = payload_timestamp(&json!({ "updated_at": s }), "updated_at");
        }

        /// Invariant: parse_remote_row never panics, and an accepted row keeps
        /// its id and payload
        #[test]
        fn parse_remote_row_never_panics(
            id in id_value(),
            stamp in prop::option::of("\\PC{0,30}"),
            has_updated_at in any::<bool>(),
        ) {
            let table = SyncTable { name: "clients".into(), has_updated_at };
            let mut row = json!({ "id": id, "name": "x" });
            if let Some(stamp) = stamp {
                row["updated_at"] = Value::String(stamp);
            }
            let pulled_at = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();

            if let Ok(parsed) = parse_remote_row(&table, row.clone(), pulled_at) {
                prop_assert_eq!(Some(parsed.record.id.clone()), payload_id(&row));
                prop_assert_eq!(parsed.record.payload, row);
            }
        }
    }
}

// ============================================================================
// QUEUE REPLAY TESTS
// ============================================================================

mod replay_tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;
    use tenarch_sync::storage::{DurableStore, MemoryStore};
    use tenarch_sync::sync::reconcile::replay;
    use tenarch_sync::{CacheStore, ChangeOperation, InMemoryBackend, SyncConfig, SyncEngine};

    fn op() -> impl Strategy<Value = (ChangeOperation, u8, u8)> {
        (
            prop_oneof![
                Just(ChangeOperation::Insert),
                Just(ChangeOperation::Update),
                Just(ChangeOperation::Delete),
            ],
            0u8..4,
            any::<u8>(),
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Invariant: replaying pending changes in FIFO order onto an empty
        /// cache reproduces what the engine shows locally
        #[test]
        fn replay_matches_local_view(ops in prop::collection::vec(op(), 1..40)) {
            let engine = SyncEngine::new(
                SyncConfig::in_memory(),
                Arc::new(MemoryStore::new()),
                Arc::new(InMemoryBackend::new()),
            )
            .unwrap();

            for (operation, id, value) in &ops {
                let payload = match operation {
                    ChangeOperation::Delete => json!({ "id": format!("t{}", id) }),
                    _ => json!({ "id": format!("t{}", id), "field": format!("f{}", value % 3), "value": value }),
                };
                engine.queue_change("tasks", *operation, payload).unwrap();
            }

            let pending = engine.pending_changes();
            prop_assert_eq!(pending.len(), ops.len());
            prop_assert!(pending.windows(2).all(|w| w[0].seq < w[1].seq));

            let fresh = CacheStore::open(Arc::new(DurableStore::new(Arc::new(MemoryStore::new())))).unwrap();
            replay(&fresh, &pending);

            let replayed: Vec<_> = fresh.get_data("tasks").into_iter().map(|r| r.payload).collect();
            prop_assert_eq!(replayed, engine.get_data("tasks"));
        }
    }
}

// ============================================================================
// CACHE ORDERING TESTS
// ============================================================================

mod cache_tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;
    use tenarch_sync::storage::{DurableStore, MemoryStore};
    use tenarch_sync::{CacheStore, CachedRecord, WriteSource};

    fn cache() -> CacheStore {
        CacheStore::open(Arc::new(DurableStore::new(Arc::new(MemoryStore::new())))).unwrap()
    }

    proptest! {
        /// Invariant: whatever order versions arrive in, the cache ends up
        /// holding the newest one
        #[test]
        fn newest_version_wins(offsets in prop::collection::vec(0i64..10_000, 1..30)) {
            let cache = cache();
            let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

            for offset in &offsets {
                let at = base + Duration::seconds(*offset);
                cache.put(
                    CachedRecord::new("clients", "c1", json!({ "id": "c1", "v": offset }), at),
                    WriteSource::Remote,
                );
            }

            let newest = *offsets.iter().max().unwrap();
            let stored = cache.get_item("clients", "c1").unwrap();
            prop_assert_eq!(stored.updated_at, base + Duration::seconds(newest));
            prop_assert_eq!(&stored.payload["v"], &json!(newest));
        }

        /// Invariant: adding records never shrinks the accounted size, and the
        /// total matches the records held
        #[test]
        fn total_bytes_grows_with_new_records(sizes in prop::collection::vec(0usize..200, 1..20)) {
            let cache = cache();
            let mut previous = 0u64;

            for (i, size) in sizes.iter().enumerate() {
                cache.put(
                    CachedRecord::new("notes", format!("n{}", i), json!({ "id": i, "body": "x".repeat(*size) }), Utc::now()),
                    WriteSource::Local,
                );
                let info = cache.storage_info();
                prop_assert!(info.total_bytes >= previous);
                previous = info.total_bytes;
            }

            let info = cache.storage_info();
            let expected: u64 = cache.get_data("notes").iter().map(CachedRecord::byte_size).sum();
            prop_assert_eq!(info.total_bytes, expected);
            prop_assert_eq!(info.record_count(), sizes.len());
        }
    }
}

// ============================================================================
// RETRY POLICY TESTS
// ============================================================================

mod backoff_tests {
    use super::*;
    use std::time::Duration;
    use tenarch_sync::RetryPolicy;

    fn policy() -> impl Strategy<Value = RetryPolicy> {
        (1u32..20, 0u64..10_000, 0u64..600_000, any::<bool>()).prop_map(
            |(max_attempts, base_delay_ms, max_delay_ms, jitter)| RetryPolicy {
                max_attempts,
                base_delay_ms,
                max_delay_ms,
                jitter,
            },
        )
    }

    proptest! {
        /// Invariant: delays never exceed the configured cap
        #[test]
        fn delay_bounded(policy in policy(), attempts in 0u32..100) {
            let delay = policy.delay_for(attempts);
            prop_assert!(delay <= Duration::from_millis(policy.max_delay_ms));
        }

        /// Invariant: without jitter, delays never decrease with more attempts
        #[test]
        fn delay_monotonic_without_jitter(policy in policy(), attempts in 1u32..60) {
            let policy = RetryPolicy { jitter: false, ..policy };
            prop_assert!(policy.delay_for(attempts) <= policy.delay_for(attempts + 1));
        }

        /// Invariant: jitter keeps at least half of the computed delay
        #[test]
        fn jitter_keeps_half(policy in policy(), attempts in 1u32..60) {
            let exact = RetryPolicy { jitter: false, ..policy.clone() }.delay_for(attempts);
            let jittered = RetryPolicy { jitter: true, ..policy }.delay_for(attempts);
            prop_assert!(jittered <= exact);
            prop_assert!(jittered.as_millis() >= exact.as_millis() / 2);
        }

        /// Invariant: exactly max_attempts attempts are allowed
        #[test]
        fn retry_budget(policy in policy()) {
            prop_assert!(policy.should_retry(policy.max_attempts - 1));
            prop_assert!(!policy.should_retry(policy.max_attempts));
        }
    }
}
