//! Change queue
//!
//! Ordered log of local mutations not yet acknowledged by the remote
//! backend. Entries carry a global `seq`; draining is FIFO per table, and an
//! entry waiting out its backoff holds back every later entry of its table.
//! Entries that exhaust their attempts, or that the backend rejects, move to
//! the dead-letter state and stay there until retried or discarded.

mod backoff;

pub use backoff::RetryPolicy;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::{Result, SyncError};
use crate::storage::DurableStore;
use crate::types::{ChangeOperation, ChangeState, QueueEntryId, QueuedChange, RecordId};

/// What happened to an entry after a failed push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Will be retried once the backoff elapses
    Retry { next_attempt_at: DateTime<Utc> },
    /// Attempts exhausted
    DeadLettered,
    /// Entry no longer in the queue
    Missing,
}

pub struct ChangeQueue {
    durable: Arc<DurableStore>,
    policy: RetryPolicy,
    /// Sorted by `seq`
    entries: RwLock<Vec<QueuedChange>>,
    next_seq: AtomicU64,
}

impl ChangeQueue {
    /// Load persisted entries
    pub fn open(durable: Arc<DurableStore>, policy: RetryPolicy) -> Result<Self> {
        let mut entries = durable.store().load_changes()?;
        entries.sort_by_key(|c| c.seq);
        let next_seq = entries.last().map(|c| c.seq + 1).unwrap_or(1);

        let pending = entries.iter().filter(|c| c.is_pending()).count();
        if !entries.is_empty() {
            tracing::info!(
                "Restored change queue: {} pending, {} dead-lettered",
                pending,
                entries.len() - pending
            );
        }

        Ok(Self {
            durable,
            policy,
            entries: RwLock::new(entries),
            next_seq: AtomicU64::new(next_seq),
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn persist(&self, change: &QueuedChange) -> bool {
        self.durable
            .write("queue save", |store| store.save_change(change))
    }

    fn unpersist(&self, id: QueueEntryId) -> bool {
        self.durable
            .remove("queue delete", |store| store.delete_change(id).map(|_| ()))
    }

    /// Append a change to the tail of the queue
    pub fn enqueue(
        &self,
        table: &str,
        record_id: RecordId,
        operation: ChangeOperation,
        payload: serde_json::Value,
    ) -> QueuedChange {
        let change = QueuedChange {
            id: QueueEntryId::new(),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            table: table.to_string(),
            record_id,
            operation,
            payload,
            queued_at: Utc::now(),
            attempts: 0,
            next_attempt_at: None,
            state: ChangeState::Pending,
            last_error: None,
        };

        self.entries.write().push(change.clone());
        self.persist(&change);

        tracing::debug!(
            "Queued {} {}/{} (seq {})",
            change.operation,
            change.table,
            change.record_id,
            change.seq
        );
        change
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get(&self, id: QueueEntryId) -> Option<QueuedChange> {
        self.entries.read().iter().find(|c| c.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.read().iter().filter(|c| c.is_pending()).count()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.entries
            .read()
            .iter()
            .filter(|c| c.is_dead_letter())
            .count()
    }

    /// Pending entries in FIFO order
    pub fn pending(&self) -> Vec<QueuedChange> {
        self.entries
            .read()
            .iter()
            .filter(|c| c.is_pending())
            .cloned()
            .collect()
    }

    pub fn dead_letters(&self) -> Vec<QueuedChange> {
        self.entries
            .read()
            .iter()
            .filter(|c| c.is_dead_letter())
            .cloned()
            .collect()
    }

    /// Pending entries for one record, in FIFO order
    pub fn pending_for_record(&self, table: &str, record_id: &str) -> Vec<QueuedChange> {
        self.entries
            .read()
            .iter()
            .filter(|c| c.is_pending() && c.table == table && c.record_id == record_id)
            .cloned()
            .collect()
    }

    pub fn has_pending_for_record(&self, table: &str, record_id: &str) -> bool {
        self.entries
            .read()
            .iter()
            .any(|c| c.is_pending() && c.table == table && c.record_id == record_id)
    }

    /// Entries that may be pushed now.
    ///
    /// An entry still in backoff blocks the rest of its table so that later
    /// changes never overtake an earlier one.
    pub fn ready(&self, now: DateTime<Utc>) -> Vec<QueuedChange> {
        let entries = self.entries.read();
        let mut blocked: HashSet<&str> = HashSet::new();
        let mut ready = Vec::new();

        for change in entries.iter().filter(|c| c.is_pending()) {
            if blocked.contains(change.table.as_str()) {
                continue;
            }
            if change.is_ready(now) {
                ready.push(change.clone());
            } else {
                blocked.insert(change.table.as_str());
            }
        }
        ready
    }

    /// Most recent dead-letter error, for status reporting
    pub fn last_dead_letter_error(&self) -> Option<String> {
        self.entries
            .read()
            .iter()
            .rev()
            .find(|c| c.is_dead_letter())
            .map(|c| {
                format!(
                    "{} {}/{} failed: {}",
                    c.operation,
                    c.table,
                    c.record_id,
                    c.last_error.as_deref().unwrap_or("unknown error")
                )
            })
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Remove an entry the backend accepted
    pub fn acknowledge(&self, id: QueueEntryId) -> bool {
        let removed = {
            let mut entries = self.entries.write();
            match entries.iter().position(|c| c.id == id) {
                Some(idx) => {
                    entries.remove(idx);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.unpersist(id);
        }
        removed
    }

    /// Count a transient failure and schedule the next attempt
    pub fn record_failure(
        &self,
        id: QueueEntryId,
        error: &str,
        now: DateTime<Utc>,
    ) -> FailureDisposition {
        let updated = {
            let mut entries = self.entries.write();
            let Some(change) = entries.iter_mut().find(|c| c.id == id) else {
                return FailureDisposition::Missing;
            };

            change.attempts += 1;
            change.last_error = Some(error.to_string());
            if self.policy.should_retry(change.attempts) {
                let delay = self.policy.delay_for(change.attempts);
                let delay = chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::milliseconds(self.policy.max_delay_ms as i64));
                change.next_attempt_at = Some(now + delay);
            } else {
                change.state = ChangeState::DeadLetter;
                change.next_attempt_at = None;
            }
            change.clone()
        };

        self.persist(&updated);

        if updated.is_dead_letter() {
            tracing::warn!(
                "Dead-lettered {} {}/{} after {} attempts: {}",
                updated.operation,
                updated.table,
                updated.record_id,
                updated.attempts,
                error
            );
            FailureDisposition::DeadLettered
        } else {
            let next_attempt_at = updated.next_attempt_at.unwrap_or(now);
            tracing::debug!(
                "Push of {}/{} failed (attempt {}), retrying after {}",
                updated.table,
                updated.record_id,
                updated.attempts,
                next_attempt_at
            );
            FailureDisposition::Retry { next_attempt_at }
        }
    }

    /// Move an entry straight to the dead-letter state
    pub fn dead_letter(&self, id: QueueEntryId, reason: &str) -> bool {
        let updated = {
            let mut entries = self.entries.write();
            let Some(change) = entries.iter_mut().find(|c| c.id == id) else {
                return false;
            };
            change.attempts += 1;
            change.state = ChangeState::DeadLetter;
            change.next_attempt_at = None;
            change.last_error = Some(reason.to_string());
            change.clone()
        };
        self.persist(&updated);
        tracing::warn!(
            "Dead-lettered {} {}/{}: {}",
            updated.operation,
            updated.table,
            updated.record_id,
            reason
        );
        true
    }

    /// Dead-letter every pending entry for a record. Returns how many moved.
    pub fn supersede(&self, table: &str, record_id: &str, reason: &str) -> usize {
        let ids: Vec<QueueEntryId> = self
            .pending_for_record(table, record_id)
            .into_iter()
            .map(|c| c.id)
            .collect();
        ids.into_iter()
            .filter(|id| self.dead_letter(*id, reason))
            .count()
    }

    /// Put a dead-lettered entry back at the tail of the queue
    pub fn retry_dead_letter(&self, id: QueueEntryId) -> Result<QueuedChange> {
        let updated = {
            let mut entries = self.entries.write();
            let idx = entries
                .iter()
                .position(|c| c.id == id && c.is_dead_letter())
                .ok_or_else(|| SyncError::NotFound(format!("dead-lettered change {}", id)))?;

            let mut change = entries.remove(idx);
            change.seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            change.state = ChangeState::Pending;
            change.attempts = 0;
            change.next_attempt_at = None;
            change.last_error = None;
            entries.push(change.clone());
            change
        };
        self.persist(&updated);
        tracing::info!(
            "Requeued {} {}/{} (seq {})",
            updated.operation,
            updated.table,
            updated.record_id,
            updated.seq
        );
        Ok(updated)
    }

    /// Drop a dead-lettered entry for good
    pub fn discard_dead_letter(&self, id: QueueEntryId) -> Result<QueuedChange> {
        let removed = {
            let mut entries = self.entries.write();
            let idx = entries
                .iter()
                .position(|c| c.id == id && c.is_dead_letter())
                .ok_or_else(|| SyncError::NotFound(format!("dead-lettered change {}", id)))?;
            entries.remove(idx)
        };
        self.unpersist(id);
        tracing::info!(
            "Discarded {} {}/{}",
            removed.operation,
            removed.table,
            removed.record_id
        );
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LocalStore, MemoryStore};
    use serde_json::json;

    fn queue_with(policy: RetryPolicy) -> (ChangeQueue, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let durable = Arc::new(DurableStore::new(store.clone()));
        (ChangeQueue::open(durable, policy).unwrap(), store)
    }

    fn enqueue(queue: &ChangeQueue, table: &str, id: &str) -> QueuedChange {
        queue.enqueue(
            table,
            id.to_string(),
            ChangeOperation::Update,
            json!({"id": id}),
        )
    }

    #[test]
    fn test_fifo_and_persistence() {
        let (queue, store) = queue_with(RetryPolicy::immediate(3));
        let a = enqueue(&queue, "clients", "c1");
        let b = enqueue(&queue, "clients", "c2");
        assert!(a.seq < b.seq);
        assert_eq!(queue.pending_count(), 2);
        assert_eq!(store.load_changes().unwrap().len(), 2);

        let ready = queue.ready(Utc::now());
        assert_eq!(ready.iter().map(|c| c.id).collect::<Vec<_>>(), vec![a.id, b.id]);

        assert!(queue.acknowledge(a.id));
        assert!(!queue.acknowledge(a.id));
        assert_eq!(store.load_changes().unwrap().len(), 1);
    }

    #[test]
    fn test_reopen_continues_sequence() {
        let store = Arc::new(MemoryStore::new());
        let last = {
            let queue = ChangeQueue::open(
                Arc::new(DurableStore::new(store.clone())),
                RetryPolicy::default(),
            )
            .unwrap();
            enqueue(&queue, "clients", "c1");
            enqueue(&queue, "tasks", "t1")
        };

        let queue =
            ChangeQueue::open(Arc::new(DurableStore::new(store)), RetryPolicy::default()).unwrap();
        assert_eq!(queue.pending_count(), 2);
        let next = enqueue(&queue, "clients", "c2");
        assert!(next.seq > last.seq);
    }

    #[test]
    fn test_backoff_blocks_rest_of_table() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 60_000,
            max_delay_ms: 60_000,
            jitter: false,
        };
        let (queue, _) = queue_with(policy);
        let first = enqueue(&queue, "clients", "c1");
        enqueue(&queue, "clients", "c2");
        let other = enqueue(&queue, "tasks", "t1");

        let now = Utc::now();
        match queue.record_failure(first.id, "network down", now) {
            FailureDisposition::Retry { next_attempt_at } => assert!(next_attempt_at > now),
            other => panic!("unexpected disposition {:?}", other),
        }

        let ready = queue.ready(now);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, other.id);

        let later = now + chrono::Duration::minutes(2);
        assert_eq!(queue.ready(later).len(), 3);
    }

    #[test]
    fn test_exhausted_attempts_dead_letter() {
        let (queue, _) = queue_with(RetryPolicy::immediate(2));
        let change = enqueue(&queue, "clients", "c1");

        assert!(matches!(
            queue.record_failure(change.id, "boom", Utc::now()),
            FailureDisposition::Retry { .. }
        ));
        assert_eq!(
            queue.record_failure(change.id, "boom", Utc::now()),
            FailureDisposition::DeadLettered
        );
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(queue.dead_letter_count(), 1);
        assert!(queue.last_dead_letter_error().unwrap().contains("boom"));
    }

    #[test]
    fn test_retry_and_discard_dead_letters() {
        let (queue, store) = queue_with(RetryPolicy::immediate(3));
        let a = enqueue(&queue, "clients", "c1");
        let b = enqueue(&queue, "clients", "c2");
        assert!(queue.dead_letter(a.id, "rejected"));
        assert!(queue.dead_letter(b.id, "rejected"));

        let retried = queue.retry_dead_letter(a.id).unwrap();
        assert!(retried.is_pending());
        assert_eq!(retried.attempts, 0);
        assert!(retried.seq > b.seq);

        queue.discard_dead_letter(b.id).unwrap();
        assert!(queue.get(b.id).is_none());
        assert_eq!(store.load_changes().unwrap().len(), 1);

        assert!(matches!(
            queue.discard_dead_letter(a.id),
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn test_supersede_only_touches_record() {
        let (queue, _) = queue_with(RetryPolicy::default());
        enqueue(&queue, "clients", "c1");
        enqueue(&queue, "clients", "c1");
        enqueue(&queue, "clients", "c2");

        assert_eq!(queue.supersede("clients", "c1", "superseded"), 2);
        assert!(!queue.has_pending_for_record("clients", "c1"));
        assert!(queue.has_pending_for_record("clients", "c2"));
        assert_eq!(queue.dead_letter_count(), 2);
    }
}
