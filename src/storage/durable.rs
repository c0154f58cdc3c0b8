//! Write-through guard around a `LocalStore`
//!
//! The cache and the queue keep the authoritative in-memory view and persist
//! each mutation through here. The first failed durable write flips the
//! session into memory-only mode: later writes that add data are skipped and
//! the failure is reported through `is_memory_only()`, never propagated to
//! callers.
//!
//! Removals keep reaching the store while memory-only, so acknowledged queue
//! entries and deleted rows do not come back after a restart. If a removal
//! fails too, the store is flagged stale and its contents are discarded the
//! next time it is opened.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::backend::LocalStore;
use super::memory_backend::MemoryStore;
use crate::error::{Result, SyncError};

pub struct DurableStore {
    store: Arc<dyn LocalStore>,
    memory_only: AtomicBool,
    last_failure: Mutex<Option<String>>,
}

impl DurableStore {
    /// Wrap a store, discarding its contents first if a previous session
    /// flagged them stale
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        match discard_if_stale(store.as_ref()) {
            Ok(()) => Self {
                store,
                memory_only: AtomicBool::new(false),
                last_failure: Mutex::new(None),
            },
            Err(e) => {
                tracing::error!(
                    "Local {} storage is stale and could not be cleared: {}",
                    store.kind(),
                    e
                );
                Self::degraded(
                    Arc::new(MemoryStore::new()),
                    format!("stale local storage could not be cleared: {}", e),
                )
            }
        }
    }

    /// Start in memory-only mode (durable store could not be opened)
    pub fn degraded(store: Arc<dyn LocalStore>, reason: impl Into<String>) -> Self {
        Self {
            store,
            memory_only: AtomicBool::new(true),
            last_failure: Mutex::new(Some(reason.into())),
        }
    }

    /// Direct access for reads during load
    pub fn store(&self) -> &dyn LocalStore {
        self.store.as_ref()
    }

    pub fn is_memory_only(&self) -> bool {
        self.memory_only.load(Ordering::Acquire)
    }

    pub fn last_failure(&self) -> Option<String> {
        self.last_failure.lock().clone()
    }

    /// Persist a mutation that adds or rewrites data. Skipped once the
    /// session is memory-only. Returns whether it reached durable storage.
    pub fn write<F>(&self, what: &str, f: F) -> bool
    where
        F: FnOnce(&dyn LocalStore) -> Result<()>,
    {
        if self.is_memory_only() {
            return false;
        }

        match f(self.store.as_ref()) {
            Ok(()) => true,
            Err(e) => {
                self.fail(what, &e);
                false
            }
        }
    }

    /// Persist a removal. Attempted even while memory-only; a failure flags
    /// the store stale so the next open does not trust what it holds.
    pub fn remove<F>(&self, what: &str, f: F) -> bool
    where
        F: FnOnce(&dyn LocalStore) -> Result<()>,
    {
        match f(self.store.as_ref()) {
            Ok(()) => true,
            Err(e) => {
                self.fail(what, &e);
                if let Err(mark_err) = self.store.set_invalidated(true) {
                    tracing::error!(
                        "Could not flag local storage stale after failed {}: {}",
                        what,
                        mark_err
                    );
                }
                false
            }
        }
    }

    fn fail(&self, what: &str, e: &SyncError) {
        if e.is_storage_degradation() {
            tracing::warn!(
                "Local storage failed during {} ({}); continuing memory-only",
                what,
                e
            );
        } else {
            tracing::error!(
                "Unexpected local storage error during {}: {}; continuing memory-only",
                what,
                e
            );
        }
        *self.last_failure.lock() = Some(e.to_string());
        self.memory_only.store(true, Ordering::Release);
    }
}

fn discard_if_stale(store: &dyn LocalStore) -> Result<()> {
    if !store.is_invalidated()? {
        return Ok(());
    }

    let changes = store.load_changes()?;
    tracing::warn!(
        "Local {} storage was left stale by a failed removal; discarding {} queued changes and all cached rows",
        store.kind(),
        changes.len()
    );
    for change in &changes {
        store.delete_change(change.id)?;
    }
    for table in store.tables()? {
        store.clear_table(&table)?;
    }
    store.clear_meta()?;
    store.set_invalidated(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        now_micros, CachedRecord, ChangeOperation, ChangeState, QueueEntryId, QueuedChange,
    };
    use serde_json::json;

    fn change(record_id: &str) -> QueuedChange {
        QueuedChange {
            id: QueueEntryId::new(),
            seq: 1,
            table: "clients".to_string(),
            record_id: record_id.to_string(),
            operation: ChangeOperation::Update,
            payload: json!({"id": record_id}),
            queued_at: now_micros(),
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
            state: ChangeState::Pending,
        }
    }

    #[test]
    fn test_first_failure_switches_to_memory_only() {
        let durable = DurableStore::new(Arc::new(MemoryStore::new()));
        assert!(durable.write("noop", |_| Ok(())));

        assert!(!durable.write("put", |_| Err(SyncError::QuotaExceeded("full".into()))));
        assert!(durable.is_memory_only());
        assert!(durable.last_failure().unwrap().contains("full"));

        let mut called = false;
        assert!(!durable.write("put", |_| {
            called = true;
            Ok(())
        }));
        assert!(!called);
    }

    #[test]
    fn test_removals_reach_store_while_memory_only() {
        let store = Arc::new(MemoryStore::new());
        let queued = change("c1");
        store.save_change(&queued).unwrap();

        let durable = DurableStore::new(store.clone());
        durable.write("put", |_| Err(SyncError::QuotaExceeded("full".into())));
        assert!(durable.is_memory_only());

        assert!(durable.remove("queue delete", |s| s.delete_change(queued.id).map(|_| ())));
        assert!(store.load_changes().unwrap().is_empty());
        assert!(!store.is_invalidated().unwrap());
    }

    #[test]
    fn test_failed_removal_discards_store_on_next_open() {
        let store = Arc::new(MemoryStore::new());
        store.save_change(&change("c1")).unwrap();
        store
            .put_record(&CachedRecord::new("clients", "c1", json!({"id": "c1"}), now_micros()))
            .unwrap();

        let durable = DurableStore::new(store.clone());
        assert!(!durable.remove("cache delete", |_| {
            Err(SyncError::StorageUnavailable("disk gone".into()))
        }));
        assert!(durable.is_memory_only());
        assert!(store.is_invalidated().unwrap());

        let reopened = DurableStore::new(store.clone());
        assert!(!reopened.is_memory_only());
        assert!(store.load_changes().unwrap().is_empty());
        assert!(store.tables().unwrap().is_empty());
        assert!(!store.is_invalidated().unwrap());
    }
}
