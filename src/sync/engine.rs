//! The sync engine handle
//!
//! `SyncEngine` is a cheaply cloneable context object owning the cache, the
//! change queue, the remote backend and the status publisher. At most one
//! pass runs at a time; overlapping requests are coalesced by an atomic
//! in-flight flag rather than queued.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_stream::{Stream, StreamExt};
use uuid::Uuid;

use super::connectivity::Connectivity;
use super::reconcile::{self, Resolution};
use super::worker::SyncWorker;
use super::SyncTrigger;
use crate::cache::{CacheEvent, CacheStore, EventFilter, WriteSource};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::queue::{ChangeQueue, FailureDisposition};
use crate::remote::{RemoteBackend, RemoteError, RemoteResult};
use crate::status::{StatusPublisher, Subscription};
use crate::storage::{DurableStore, LocalStore, MemoryStore, SqliteStore, StorageOptions};
use crate::types::{
    now_micros, payload_id, CachedRecord, ChangeOperation, QueueEntryId, QueuedChange, RecordId,
    Snapshot, StorageInfo, SyncOutcome, SyncReport, SyncStatus, SyncTable, TableMeta,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassMode {
    /// Pull every table (incrementally where possible), then drain
    Sync,
    /// Pull every table in full, then drain
    FullResync,
    /// Drain only
    PushOnly,
}

#[derive(Debug, Default)]
struct TablePull {
    parsed: usize,
    skipped: usize,
    superseded: usize,
    removed: usize,
}

struct Inner {
    config: SyncConfig,
    durable: Arc<DurableStore>,
    cache: CacheStore,
    queue: ChangeQueue,
    remote: Arc<dyn RemoteBackend>,
    status: StatusPublisher,
    connectivity: Connectivity,
    in_flight: AtomicBool,
    initialized: AtomicBool,
    passes: AtomicU64,
    last_pass_error: Mutex<Option<String>>,
    worker: Mutex<Option<SyncWorker>>,
}

/// Clears the in-flight flag when a pass ends, even on panic
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Offline sync engine
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

#[derive(Clone)]
pub(crate) struct WeakSyncEngine {
    inner: Weak<Inner>,
}

impl WeakSyncEngine {
    pub(crate) fn upgrade(&self) -> Option<SyncEngine> {
        self.inner.upgrade().map(|inner| SyncEngine { inner })
    }
}

impl SyncEngine {
    /// Build an engine over an explicit local store
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteBackend>,
    ) -> Result<Self> {
        Self::with_durable(config, Arc::new(DurableStore::new(store)), remote)
    }

    /// Open the SQLite cache named by the config.
    ///
    /// If the cache file cannot be opened for storage reasons the engine
    /// starts memory-only instead of failing.
    pub fn open(config: SyncConfig, remote: Arc<dyn RemoteBackend>) -> Result<Self> {
        config.validate()?;

        let durable = match SqliteStore::open(StorageOptions::from(&config)) {
            Ok(store) => DurableStore::new(Arc::new(store)),
            Err(e) if e.is_storage_degradation() => {
                tracing::warn!(
                    "Could not open offline cache at {} ({}); running memory-only",
                    config.expanded_db_path(),
                    e
                );
                DurableStore::degraded(Arc::new(MemoryStore::new()), e.to_string())
            }
            Err(e) => return Err(e),
        };

        Self::with_durable(config, Arc::new(durable), remote)
    }

    fn with_durable(
        config: SyncConfig,
        durable: Arc<DurableStore>,
        remote: Arc<dyn RemoteBackend>,
    ) -> Result<Self> {
        config.validate()?;

        let cache = CacheStore::open(durable.clone())?;
        let queue = ChangeQueue::open(durable.clone(), config.retry.clone())?;

        let status = StatusPublisher::new(SyncStatus {
            is_online: true,
            pending_changes: queue.pending_count(),
            dead_letters: queue.dead_letter_count(),
            storage_degraded: durable.is_memory_only(),
            error: queue.last_dead_letter_error(),
            ..Default::default()
        });

        tracing::debug!(
            "Sync engine ready: {} tables, store {}, remote {}",
            config.tables.len(),
            durable.store().kind(),
            remote.name()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                durable,
                cache,
                queue,
                remote,
                status,
                connectivity: Connectivity::new(true),
                in_flight: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                passes: AtomicU64::new(0),
                last_pass_error: Mutex::new(None),
                worker: Mutex::new(None),
            }),
        })
    }

    pub(crate) fn downgrade(&self) -> WeakSyncEngine {
        WeakSyncEngine {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Direct access to cached records (with timestamps)
    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the background worker and run the initial sync.
    ///
    /// Only the first call does anything; later calls (concurrent or not)
    /// return `None` immediately. The initial pass runs only when online and
    /// a user session exists.
    pub async fn init(&self) -> Option<SyncReport> {
        if self
            .inner
            .initialized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Sync engine already initialized");
            return None;
        }

        tracing::info!(
            "Initializing sync engine ({} tables, {} pending changes)",
            self.inner.config.tables.len(),
            self.inner.queue.pending_count()
        );

        let worker = SyncWorker::start(
            self.downgrade(),
            self.inner.connectivity.subscribe(),
            self.inner.config.sync_interval(),
        );
        *self.inner.worker.lock() = Some(worker);

        if !self.is_online() {
            tracing::info!("Starting offline; serving cached data");
            return None;
        }
        if !self.inner.remote.has_session().await {
            tracing::info!("No user session; skipping initial sync");
            return None;
        }

        Some(self.run(SyncTrigger::AppStart).await)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::Acquire)
    }

    /// Stop the background worker
    pub async fn shutdown(&self) {
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            worker.stop().await;
        }
    }

    // ========================================================================
    // Sync passes
    // ========================================================================

    /// Pull every table, then push queued changes. Never fails; problems are
    /// reported in the returned report and in the status.
    pub async fn sync_all(&self) -> SyncReport {
        self.run(SyncTrigger::Manual).await
    }

    /// Forget staleness markers and re-pull every table in full
    pub async fn force_full_sync(&self) -> SyncReport {
        self.execute(SyncTrigger::Manual, PassMode::FullResync).await
    }

    /// Push queued changes without pulling
    pub async fn push_pending(&self) -> SyncReport {
        self.execute(SyncTrigger::Manual, PassMode::PushOnly).await
    }

    /// Platform background-sync message; same as `sync_all`
    pub async fn handle_background_sync(&self) -> SyncReport {
        self.run(SyncTrigger::Background).await
    }

    /// Run a pass for a trigger
    pub async fn run(&self, trigger: SyncTrigger) -> SyncReport {
        let mode = match trigger {
            SyncTrigger::LocalWrite => PassMode::PushOnly,
            _ => PassMode::Sync,
        };
        self.execute(trigger, mode).await
    }

    /// Ask for a pass without waiting for it
    pub fn request_sync(&self, trigger: SyncTrigger) {
        let sent = self
            .inner
            .worker
            .lock()
            .as_ref()
            .is_some_and(|worker| worker.request(trigger));
        if !sent {
            self.spawn_pass(trigger);
        }
    }

    fn spawn_pass(&self, trigger: SyncTrigger) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let engine = self.clone();
                handle.spawn(async move {
                    engine.run(trigger).await;
                });
            }
            Err(_) => tracing::debug!("No runtime available for {} sync", trigger),
        }
    }

    /// Number of passes that actually started (coalesced and offline
    /// requests excluded)
    pub fn passes_started(&self) -> u64 {
        self.inner.passes.load(Ordering::SeqCst)
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    async fn execute(&self, trigger: SyncTrigger, mode: PassMode) -> SyncReport {
        if !self.is_online() {
            tracing::debug!("Skipping {} sync: offline", trigger);
            return SyncReport::new(SyncOutcome::Offline);
        }
        if self
            .inner
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Sync already in flight; coalescing {} trigger", trigger);
            return SyncReport::new(SyncOutcome::Coalesced);
        }
        let _in_flight = InFlight(&self.inner.in_flight);

        self.inner.passes.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        self.inner.status.update(|s| s.is_syncing = true);
        tracing::debug!("Starting {:?} pass ({})", mode, trigger);

        let mut report = SyncReport::new(SyncOutcome::Completed);
        let mut pass_error = None;

        if mode == PassMode::FullResync {
            self.inner.cache.clear_meta();
        }

        if mode != PassMode::PushOnly {
            match self.pull_all(mode, &mut report).await {
                Ok(Some(table_error)) => {
                    pass_error = Some(format!(
                        "{} table(s) failed to sync: {}",
                        report.tables_failed, table_error
                    ));
                }
                Ok(None) => {}
                Err(e) => {
                    report.outcome = SyncOutcome::Failed;
                    pass_error = Some(format!("Sync failed: {}", e));
                }
            }
        }

        if report.outcome == SyncOutcome::Completed {
            if let Err(e) = self.drain(&mut report).await {
                report.outcome = SyncOutcome::Failed;
                pass_error = Some(format!("Push failed: {}", e));
            }
        }

        if let Some(error) = &pass_error {
            if report.outcome == SyncOutcome::Failed {
                report.errors.push(error.clone());
            }
        }
        *self.inner.last_pass_error.lock() = pass_error;

        let synced_at = (report.outcome == SyncOutcome::Completed && mode != PassMode::PushOnly)
            .then(Utc::now);
        self.publish_status(|s| {
            s.is_syncing = false;
            if let Some(at) = synced_at {
                s.last_synced_at = Some(at);
            }
        });

        let elapsed = started.elapsed();
        match report.outcome {
            SyncOutcome::Failed => tracing::error!(
                "Sync pass ({}) failed after {:?}: {}",
                trigger,
                elapsed,
                report.errors.join("; ")
            ),
            _ => tracing::info!(
                "Sync pass ({}) completed in {:?}: {} tables, {} records pulled, {} skipped, {} changes pushed, {} dead-lettered",
                trigger,
                elapsed,
                report.tables_pulled,
                report.records_pulled,
                report.records_skipped,
                report.changes_pushed,
                report.changes_dead_lettered
            ),
        }

        report
    }

    /// Bound a remote call by the configured timeout
    async fn call<T, F>(&self, fut: F) -> RemoteResult<T>
    where
        F: Future<Output = RemoteResult<T>>,
    {
        let timeout = self.inner.config.request_timeout();
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(timeout)),
        }
    }

    /// Pull every table. Transient and authorization errors abort; other
    /// per-table errors are recorded and the first one is returned.
    async fn pull_all(&self, mode: PassMode, report: &mut SyncReport) -> RemoteResult<Option<String>> {
        let mut first_error = None;

        for table in &self.inner.config.tables {
            let full = mode == PassMode::FullResync || !table.has_updated_at;
            match self.pull_table(table, full).await {
                Ok(pull) => {
                    report.tables_pulled += 1;
                    report.records_pulled += pull.parsed;
                    report.records_skipped += pull.skipped;
                    report.changes_dead_lettered += pull.superseded;
                    tracing::debug!(
                        "Pulled {}: {} rows, {} skipped, {} removed",
                        table.name,
                        pull.parsed,
                        pull.skipped,
                        pull.removed
                    );
                }
                Err(e) if e.is_transient() || e.is_unauthorized() => {
                    tracing::warn!("Pull of {} failed: {}", table.name, e);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!("Pull of {} failed: {}", table.name, e);
                    report.tables_failed += 1;
                    let message = format!("{}: {}", table.name, e);
                    report.errors.push(message.clone());
                    first_error.get_or_insert(message);
                }
            }
        }

        Ok(first_error)
    }

    async fn pull_table(&self, table: &SyncTable, full: bool) -> RemoteResult<TablePull> {
        let cache = &self.inner.cache;
        let queue = &self.inner.queue;
        let policy = self.inner.config.conflict_policy;

        let meta = cache.meta(&table.name);
        let since = if full {
            None
        } else {
            meta.as_ref().map(|m| m.last_synced_at)
        };
        let pulled_at = now_micros();

        let rows = self.call(self.inner.remote.select(&table.name, since)).await?;

        let mut pull = TablePull::default();
        let mut seen: HashSet<RecordId> = HashSet::with_capacity(rows.len());
        let mut accepted = Vec::with_capacity(rows.len());
        let mut last_modified = meta.map(|m| m.last_modified_at);

        for row in rows {
            if let Some(id) = payload_id(&row) {
                seen.insert(id);
            }
            let remote = match reconcile::parse_remote_row(table, row, pulled_at) {
                Ok(remote) => remote,
                Err(e) => {
                    tracing::warn!("Skipping {} row: {}", table.name, e);
                    pull.skipped += 1;
                    continue;
                }
            };
            pull.parsed += 1;
            if remote.has_timestamp {
                let at = remote.record.updated_at;
                last_modified = Some(last_modified.map_or(at, |prev| prev.max(at)));
            }

            let pending = queue.pending_for_record(&table.name, &remote.record.id);
            let cached = cache.get_item(&table.name, &remote.record.id);
            match reconcile::resolve(policy, &remote, &pending, cached.as_ref()) {
                Resolution::TakeRemote => accepted.push(remote.record),
                Resolution::KeepLocal => {
                    tracing::debug!(
                        "Keeping local version of {}/{} ({} pending)",
                        table.name,
                        remote.record.id,
                        pending.len()
                    );
                }
                Resolution::SupersedeLocal => {
                    let reason = format!(
                        "superseded by remote version from {}",
                        remote.record.updated_at.to_rfc3339()
                    );
                    pull.superseded += queue.supersede(&table.name, &remote.record.id, &reason);
                    accepted.push(remote.record);
                }
            }
        }

        cache.put_many(accepted, WriteSource::Remote);

        if since.is_none() {
            pull.removed = self.prune(table, &seen);
        }

        cache.set_meta(TableMeta {
            table: table.name.clone(),
            last_synced_at: pulled_at,
            last_modified_at: last_modified.unwrap_or(pulled_at),
        });

        Ok(pull)
    }

    /// After a full pull, drop cached records the backend no longer has,
    /// unless local changes for them are still pending
    fn prune(&self, table: &SyncTable, seen: &HashSet<RecordId>) -> usize {
        let cache = &self.inner.cache;
        cache
            .ids(&table.name)
            .into_iter()
            .filter(|id| !seen.contains(id))
            .filter(|id| !self.inner.queue.has_pending_for_record(&table.name, id))
            .filter(|id| cache.remove(&table.name, id, WriteSource::Remote))
            .count()
    }

    /// Push ready changes in FIFO order. A transient failure stops the drain.
    async fn drain(&self, report: &mut SyncReport) -> RemoteResult<()> {
        let queue = &self.inner.queue;
        let ready = queue.ready(Utc::now());
        if ready.is_empty() {
            return Ok(());
        }
        tracing::debug!("Pushing {} queued changes", ready.len());

        for change in ready {
            // Superseded during the pull
            if !queue.get(change.id).is_some_and(|c| c.is_pending()) {
                continue;
            }

            match self.push_change(&change).await {
                Ok(echo) => {
                    queue.acknowledge(change.id);
                    report.changes_pushed += 1;
                    if let Some(row) = echo {
                        self.confirm(&change, row);
                    }
                }
                Err(RemoteError::Malformed(message)) => {
                    // The write went through; only the echo was unreadable
                    tracing::warn!(
                        "Unreadable response for {} {}/{}: {}",
                        change.operation,
                        change.table,
                        change.record_id,
                        message
                    );
                    queue.acknowledge(change.id);
                    report.changes_pushed += 1;
                }
                Err(e) if e.is_unauthorized() => {
                    // Entry stays as it was; the next pass after sign-in retries it
                    tracing::warn!(
                        "Push of {} {}/{} not authorized: {}",
                        change.operation,
                        change.table,
                        change.record_id,
                        e
                    );
                    report.changes_failed += 1;
                    self.refresh_status();
                    return Err(e);
                }
                Err(e) if e.is_transient() => {
                    report.changes_failed += 1;
                    if queue.record_failure(change.id, &e.to_string(), Utc::now())
                        == FailureDisposition::DeadLettered
                    {
                        report.changes_dead_lettered += 1;
                        report.changes_dead_lettered += self.block_dependents(&change);
                    }
                    self.refresh_status();
                    return Err(e);
                }
                Err(e) => {
                    queue.dead_letter(change.id, &e.to_string());
                    report.changes_dead_lettered += 1;
                    report.changes_dead_lettered += self.block_dependents(&change);
                    report.errors.push(format!(
                        "{} {}/{}: {}",
                        change.operation, change.table, change.record_id, e
                    ));
                }
            }
            self.refresh_status();
        }

        Ok(())
    }

    /// Dead-letter the record's later entries once one of its changes failed
    /// for good; they were built on top of it
    fn block_dependents(&self, failed: &QueuedChange) -> usize {
        let blocked = self.inner.queue.supersede(
            &failed.table,
            &failed.record_id,
            &format!("blocked by failed change {}", failed.id),
        );
        if blocked > 0 {
            tracing::warn!(
                "Dead-lettered {} later change(s) to {}/{} behind failed change {}",
                blocked,
                failed.table,
                failed.record_id,
                failed.id
            );
        }
        blocked
    }

    async fn push_change(&self, change: &QueuedChange) -> RemoteResult<Option<Value>> {
        let remote = &self.inner.remote;
        match change.operation {
            ChangeOperation::Insert => {
                self.call(remote.insert(&change.table, &change.payload))
                    .await
            }
            ChangeOperation::Update => {
                self.call(remote.update(&change.table, &change.record_id, &change.payload))
                    .await
            }
            ChangeOperation::Delete => self
                .call(remote.delete(&change.table, &change.record_id))
                .await
                .map(|_| None),
        }
    }

    /// Cache the backend's copy of an acknowledged write, unless newer local
    /// changes to the record are still queued
    fn confirm(&self, change: &QueuedChange, row: Value) {
        if self
            .inner
            .queue
            .has_pending_for_record(&change.table, &change.record_id)
        {
            return;
        }
        let Some(table) = self.inner.config.table(&change.table) else {
            return;
        };
        match reconcile::parse_remote_row(table, row, now_micros()) {
            Ok(remote) if remote.record.id == change.record_id => {
                self.inner.cache.confirm(remote.record)
            }
            Ok(remote) => tracing::warn!(
                "Backend echoed {}/{} for a write to {}",
                change.table,
                remote.record.id,
                change.record_id
            ),
            Err(e) => tracing::warn!("Ignoring echo for {}/{}: {}", change.table, change.record_id, e),
        }
    }

    // ========================================================================
    // Local mutations
    // ========================================================================

    /// Apply a mutation to the cache and queue it for the backend.
    ///
    /// Only invalid input is an error: an unknown table, a non-object
    /// payload, or an update/delete without an `id`. Inserts without an id
    /// get a fresh UUID. Local storage failures never surface here.
    pub fn queue_change(
        &self,
        table: &str,
        operation: ChangeOperation,
        data: Value,
    ) -> Result<QueueEntryId> {
        let inner = &self.inner;
        if inner.config.table(table).is_none() {
            return Err(SyncError::UnknownTable(table.to_string()));
        }
        if !data.is_object() {
            return Err(SyncError::InvalidInput(format!(
                "{} payload for {} must be a JSON object",
                operation, table
            )));
        }

        let (record_id, payload) = match payload_id(&data) {
            Some(id) => (id, data),
            None if operation == ChangeOperation::Insert => {
                let id = Uuid::new_v4().to_string();
                let mut data = data;
                if let Some(fields) = data.as_object_mut() {
                    fields.insert("id".to_string(), Value::String(id.clone()));
                }
                (id, data)
            }
            None => {
                return Err(SyncError::InvalidInput(format!(
                    "{} on {} requires an id",
                    operation, table
                )))
            }
        };

        let cache = &inner.cache;
        let stamp = cache.next_local_timestamp(table, &record_id);
        let current = cache.get_item(table, &record_id).map(|r| r.payload);
        match reconcile::apply_change(current, operation, &payload) {
            Some(next) => {
                cache.put(
                    CachedRecord::new(table, record_id.clone(), next, stamp),
                    WriteSource::Local,
                );
            }
            None => {
                cache.remove(table, &record_id, WriteSource::Local);
            }
        }

        let change = inner.queue.enqueue(table, record_id, operation, payload);
        self.refresh_status();

        if inner.config.push_on_write && self.is_online() {
            self.spawn_pass(SyncTrigger::LocalWrite);
        }

        Ok(change.id)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Cached payloads of a table
    pub fn get_data(&self, table: &str) -> Vec<Value> {
        self.inner
            .cache
            .get_data(table)
            .into_iter()
            .map(|r| r.payload)
            .collect()
    }

    pub fn get_item(&self, table: &str, id: &str) -> Option<Value> {
        self.inner.cache.get_item(table, id).map(|r| r.payload)
    }

    /// Cached rows of a table decoded into `T`
    pub fn get_data_as<T: DeserializeOwned>(&self, table: &str) -> Result<Vec<T>> {
        self.get_data(table)
            .into_iter()
            .map(|payload| serde_json::from_value(payload).map_err(SyncError::from))
            .collect()
    }

    pub fn get_item_as<T: DeserializeOwned>(&self, table: &str, id: &str) -> Result<Option<T>> {
        self.get_item(table, id)
            .map(|payload| serde_json::from_value(payload).map_err(SyncError::from))
            .transpose()
    }

    pub fn has_cached_data(&self) -> bool {
        self.inner.cache.has_cached_data()
    }

    pub fn storage_info(&self) -> StorageInfo {
        self.inner.cache.storage_info()
    }

    pub fn pending_changes_count(&self) -> usize {
        self.inner.queue.pending_count()
    }

    pub fn pending_changes(&self) -> Vec<QueuedChange> {
        self.inner.queue.pending()
    }

    pub fn dead_letters(&self) -> Vec<QueuedChange> {
        self.inner.queue.dead_letters()
    }

    /// Requeue a dead-lettered change at the tail and reapply it locally
    pub fn retry_dead_letter(&self, id: QueueEntryId) -> Result<()> {
        let change = self.inner.queue.retry_dead_letter(id)?;
        reconcile::replay(&self.inner.cache, std::slice::from_ref(&change));
        self.refresh_status();

        if self.inner.config.push_on_write && self.is_online() {
            self.spawn_pass(SyncTrigger::LocalWrite);
        }
        Ok(())
    }

    /// Drop a dead-lettered change.
    ///
    /// When nothing else is pending for the record its local version is
    /// dropped too, and the next pass re-pulls every table in full.
    pub fn discard_dead_letter(&self, id: QueueEntryId) -> Result<()> {
        let change = self.inner.queue.discard_dead_letter(id)?;
        if !self
            .inner
            .queue
            .has_pending_for_record(&change.table, &change.record_id)
        {
            self.inner
                .cache
                .remove(&change.table, &change.record_id, WriteSource::Local);
            self.inner.cache.clear_meta();
        }
        self.refresh_status();
        Ok(())
    }

    // ========================================================================
    // Backup / restore
    // ========================================================================

    pub fn export_snapshot(&self) -> Snapshot {
        self.inner.cache.export_snapshot()
    }

    /// Import a snapshot of registered tables. Returns the records imported.
    pub fn import_snapshot(&self, snapshot: Snapshot) -> Result<usize> {
        if let Some(unknown) = snapshot
            .keys()
            .find(|name| self.inner.config.table(name).is_none())
        {
            return Err(SyncError::UnknownTable(unknown.clone()));
        }
        let imported = self.inner.cache.import_snapshot(snapshot)?;
        tracing::info!("Imported {} records from snapshot", imported);
        self.refresh_status();
        Ok(imported)
    }

    /// Import a normalized backup (see `normalize_backup`). Tables that are
    /// not registered are skipped; a backup with none of them is an error.
    pub fn import_backup(&self, mut snapshot: Snapshot) -> Result<usize> {
        let skipped: Vec<String> = snapshot
            .keys()
            .filter(|name| self.inner.config.table(name).is_none())
            .cloned()
            .collect();
        for name in &skipped {
            let rows = snapshot.remove(name).map_or(0, |rows| rows.len());
            tracing::warn!("Skipping {} rows of unregistered table {} in backup", rows, name);
        }
        if snapshot.is_empty() {
            return Err(SyncError::InvalidInput(format!(
                "backup holds no registered tables (found: {})",
                skipped.join(", ")
            )));
        }
        self.import_snapshot(snapshot)
    }

    // ========================================================================
    // Connectivity and status
    // ========================================================================

    pub fn is_online(&self) -> bool {
        self.inner.connectivity.is_online()
    }

    /// Feed a platform online/offline signal
    pub fn set_online(&self, online: bool) {
        if self.inner.connectivity.set(online) {
            tracing::info!("Connectivity changed: {}", if online { "online" } else { "offline" });
            self.inner.status.update(|s| s.is_online = online);
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.status.current()
    }

    /// Register a status callback; it fires immediately with the current
    /// status and again on every transition
    pub fn on_status_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        self.inner.status.on_status_change(callback)
    }

    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.watch()
    }

    /// Status transitions as a stream, starting with the current status
    pub fn status_stream(&self) -> WatchStream<SyncStatus> {
        WatchStream::new(self.watch())
    }

    /// Cache write events
    pub fn cache_events(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.cache.subscribe()
    }

    /// Cache write events matching `filter`. Lagged receivers skip ahead.
    pub fn cache_event_stream(&self, filter: EventFilter) -> impl Stream<Item = CacheEvent> {
        BroadcastStream::new(self.cache_events()).filter_map(move |event| match event {
            Ok(event) if filter.matches(&event) => Some(event),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                tracing::debug!("Cache event stream lagged, {} events missed", missed);
                None
            }
        })
    }

    fn refresh_status(&self) {
        self.publish_status(|_| {});
    }

    /// Recompute the derived fields and apply `f` in a single transition
    fn publish_status<F>(&self, f: F)
    where
        F: FnOnce(&mut SyncStatus),
    {
        let queue = &self.inner.queue;
        let pending = queue.pending_count();
        let dead_letters = queue.dead_letter_count();
        let degraded = self.inner.durable.is_memory_only();

        let error = self
            .inner
            .last_pass_error
            .lock()
            .clone()
            .or_else(|| queue.last_dead_letter_error())
            .or_else(|| {
                degraded.then(|| {
                    format!(
                        "Local storage unavailable, running memory-only: {}",
                        self.inner
                            .durable
                            .last_failure()
                            .unwrap_or_else(|| "unknown failure".to_string())
                    )
                })
            });

        self.inner.status.update(|s| {
            f(s);
            s.pending_changes = pending;
            s.dead_letters = dead_letters;
            s.storage_degraded = degraded;
            s.error = error;
        });
    }
}
