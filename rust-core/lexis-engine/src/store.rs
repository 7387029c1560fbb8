// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//! Store manager.
//!
//! [`StoreManager`] owns every collection, the shared cache layer, the
//! transaction manager, the persistence engine and the sync queue, and is
//! the only public entry point to them. It is a cheap `Clone` handle; build
//! one at startup with [`StoreBuilder`] and pass clones to collaborators.
//!
//! # Mutation lifecycle
//!
//! ```text
//! Requested ─> Validated ─> Applied-in-memory ─> Cached ─> [Queued-for-sync] ─> [Flushed]
//!     │
//!     └─> Rejected (CapacityError, TypeMismatch, UnknownCollection, ConcurrentTransaction)
//! ```
//!
//! A mutation is applied once it is in memory. Durability comes from the
//! next flush (periodic, or immediate for `SetOptions::immediate` and
//! critical collections); flush and replay failures are logged and retried,
//! never returned to the caller of `set`/`delete`.
//!
//! # Locking
//!
//! All in-memory state sits behind one synchronous mutex that is never held
//! across an `.await`. Flushes encode under the lock and write outside it;
//! a mutation that lands while a write is in flight leaves the collection
//! dirty for the next flush.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use lexis_storage::StorageBackend;

use crate::cache::{CacheLayer, CacheStats};
use crate::clock::{Clock, SystemClock};
use crate::collection::{Collection, CollectionStats};
use crate::compression::{Base64Compressor, Compressor};
use crate::config::EngineConfig;
use crate::entry::Entry;
use crate::error::{EngineError, PersistError};
use crate::persistence::{FlushJob, PersistenceEngine};
use crate::sync::{DrainReport, RemoteSync, SyncOperation, SyncQueue};
use crate::transaction::{SavedEntries, TransactionManager, TransactionStats};
use crate::typed::TypedCollection;

/// Per-write options for [`StoreManager::set`].
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// TTL in milliseconds for this entry. `None` takes the collection
    /// default; `Some(0)` never expires.
    pub ttl: Option<u64>,
    /// Flush the collection before `set` returns.
    pub immediate: bool,
    pub metadata: BTreeMap<String, Value>,
}

impl SetOptions {
    pub fn immediate() -> Self {
        Self {
            immediate: true,
            ..Default::default()
        }
    }

    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl = Some(ttl_ms);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Result of one [`StoreManager::flush_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    pub flushed: Vec<String>,
    pub failed: Vec<String>,
    /// Dirty collections skipped because a transaction owns them.
    pub locked: Vec<String>,
    pub sync_queue_saved: bool,
}

/// Result of one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub purged: usize,
    pub sync: DrainReport,
    pub flush: FlushReport,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub collections: usize,
    pub entries: usize,
    pub expired_skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub namespace: String,
    pub backend: String,
    pub collections: Vec<CollectionStats>,
    pub cache: CacheStats,
    pub transactions: TransactionStats,
    pub sync_pending: usize,
    pub sync_dead_letters: usize,
}

/// Every collection's live entries plus engine statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub namespace: String,
    pub exported_at: i64,
    pub collections: BTreeMap<String, BTreeMap<String, Entry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<EngineStats>,
}

/// What a successful mutation still owes the sync queue and the disk.
struct Mutation {
    sync: Vec<SyncOperation>,
    critical: bool,
}

struct EngineState {
    collections: HashMap<String, Collection>,
    cache: CacheLayer,
    txns: TransactionManager,
}

fn unknown(name: &str) -> EngineError {
    EngineError::UnknownCollection(name.to_string())
}

impl EngineState {
    fn collection(&self, name: &str) -> Result<&Collection, EngineError> {
        self.collections.get(name).ok_or_else(|| unknown(name))
    }

    /// Fail unless `name` exists and is free, or is owned by `txn`.
    fn ensure_writable(&self, name: &str, txn: Option<Uuid>) -> Result<(), EngineError> {
        self.collection(name)?;
        match (self.txns.owner_of(name), txn) {
            (None, None) => Ok(()),
            (Some(owner), Some(id)) if owner == id => Ok(()),
            (Some(owner), _) => Err(EngineError::ConcurrentTransaction {
                collection: name.to_string(),
                owner,
            }),
            (None, Some(id)) => Err(EngineError::UnknownTransaction(id)),
        }
    }

    fn read(&mut self, name: &str, key: &str, now: i64) -> Result<Option<Value>, EngineError> {
        let coll = self.collections.get_mut(name).ok_or_else(|| unknown(name))?;
        coll.touch(now);
        let cached = coll.config().cached;

        if cached {
            if let Some(entry) = self.cache.get(name, key) {
                if !entry.is_expired(now) {
                    return Ok(Some(entry.value));
                }
                self.cache.invalidate(name, key);
            }
        }

        let found = coll.read(key, now).cloned();
        if cached {
            if let Some(entry) = &found {
                self.cache.put(name, key, entry);
            }
        }
        Ok(found.map(|entry| entry.value))
    }

    fn scan<F>(&mut self, name: &str, now: i64, predicate: F) -> Result<BTreeMap<String, Value>, EngineError>
    where
        F: FnMut(&str, &Value) -> bool,
    {
        let coll = self.collections.get_mut(name).ok_or_else(|| unknown(name))?;
        coll.touch(now);
        Ok(coll.scan(now, predicate))
    }

    fn apply_set(
        &mut self,
        name: &str,
        key: &str,
        value: Value,
        options: &SetOptions,
        now: i64,
    ) -> Result<Mutation, EngineError> {
        let coll = self.collections.get_mut(name).ok_or_else(|| unknown(name))?;
        let ttl = options.ttl.unwrap_or(coll.config().ttl_ms);
        let entry = Entry::new(value, now, ttl).with_metadata(options.metadata.clone());
        coll.write(key, entry.clone())?;
        coll.touch(now);

        let config = coll.config();
        if config.cached {
            self.cache.put(name, key, &entry);
        }
        let sync = if config.sync {
            vec![SyncOperation::set(name, key, entry.value, now)]
        } else {
            Vec::new()
        };
        Ok(Mutation {
            sync,
            critical: config.critical,
        })
    }

    /// `None` when the key was absent (or already expired).
    fn apply_delete(&mut self, name: &str, key: &str, now: i64) -> Result<Option<Mutation>, EngineError> {
        let coll = self.collections.get_mut(name).ok_or_else(|| unknown(name))?;
        self.cache.invalidate(name, key);
        if coll.read(key, now).is_none() {
            return Ok(None);
        }
        coll.remove(key);
        coll.touch(now);

        let config = coll.config();
        let sync = if config.sync {
            vec![SyncOperation::delete(name, key, now)]
        } else {
            Vec::new()
        };
        Ok(Some(Mutation {
            sync,
            critical: config.critical,
        }))
    }

    fn apply_clear(&mut self, name: &str, now: i64) -> Result<(usize, Mutation), EngineError> {
        let coll = self.collections.get_mut(name).ok_or_else(|| unknown(name))?;
        let keys: Vec<String> = coll.entries().keys().cloned().collect();
        coll.clear();
        coll.touch(now);
        self.cache.invalidate_collection(name);

        let config = coll.config();
        let sync = if config.sync {
            keys.iter()
                .map(|key| SyncOperation::delete(name, key, now))
                .collect()
        } else {
            Vec::new()
        };
        Ok((
            keys.len(),
            Mutation {
                sync,
                critical: config.critical && !keys.is_empty(),
            },
        ))
    }

    fn rollback(&mut self, id: Uuid) -> Result<(), EngineError> {
        let saved = self.txns.rollback(id)?;
        for (name, entries) in saved {
            if let Some(coll) = self.collections.get_mut(&name) {
                coll.restore(entries);
            }
            self.cache.invalidate_collection(&name);
        }
        Ok(())
    }

    fn purge_expired(&mut self, now: i64) -> usize {
        let mut purged = 0;
        for (name, coll) in self.collections.iter_mut() {
            if self.txns.owner_of(name).is_some() {
                continue;
            }
            let expired = coll.purge_expired(now);
            if expired.is_empty() {
                continue;
            }
            for key in &expired {
                self.cache.invalidate(name, key);
            }
            if coll.config().persistent {
                coll.mark_dirty();
            }
            debug!(collection = %name, purged = expired.len(), "Expired entries purged");
            purged += expired.len();
        }
        purged
    }

    fn import(&mut self, name: &str, entries: BTreeMap<String, Entry>) -> usize {
        self.cache.invalidate_collection(name);
        match self.collections.get_mut(name) {
            Some(coll) => coll.import(entries),
            None => 0,
        }
    }
}

struct Shared<B: StorageBackend> {
    config: EngineConfig,
    state: Mutex<EngineState>,
    persistence: PersistenceEngine<B>,
    sync: SyncQueue,
    /// Set once the persisted sync queue has been folded in.
    sync_restored: OnceCell<()>,
    remote: Option<Arc<dyn RemoteSync>>,
    clock: Arc<dyn Clock>,
}

/// Builds a [`StoreManager`] from a configuration and its collaborators.
pub struct StoreBuilder<B: StorageBackend> {
    config: EngineConfig,
    backend: B,
    remote: Option<Arc<dyn RemoteSync>>,
    clock: Arc<dyn Clock>,
    compressor: Arc<dyn Compressor>,
}

impl<B: StorageBackend> StoreBuilder<B> {
    pub fn new(config: EngineConfig, backend: B) -> Self {
        Self {
            config,
            backend,
            remote: None,
            clock: Arc::new(SystemClock),
            compressor: Arc::new(Base64Compressor),
        }
    }

    /// Remote endpoint for sync replay. Without one, sync operations
    /// accumulate until the engine is rebuilt with a remote.
    pub fn remote(mut self, remote: Arc<dyn RemoteSync>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn build(self) -> Result<StoreManager<B>, EngineError> {
        self.config.validate()?;

        let collections: HashMap<String, Collection> = self
            .config
            .collections
            .iter()
            .map(|spec| {
                (
                    spec.name.clone(),
                    Collection::configure(spec.name.clone(), spec.config.clone()),
                )
            })
            .collect();
        let state = EngineState {
            collections,
            cache: CacheLayer::new(self.config.cache_ceiling_bytes),
            txns: TransactionManager::new(),
        };
        let compressor = self.compressor.name().to_string();
        let persistence =
            PersistenceEngine::new(Arc::new(self.backend), &self.config.namespace, self.compressor);

        info!(
            namespace = %self.config.namespace,
            backend = persistence.backend().name(),
            compressor = %compressor,
            collections = state.collections.len(),
            cache_ceiling = self.config.cache_ceiling_bytes,
            "Store manager initialised"
        );

        Ok(StoreManager {
            shared: Arc::new(Shared {
                sync: SyncQueue::new(self.config.sync),
                config: self.config,
                state: Mutex::new(state),
                persistence,
                sync_restored: OnceCell::new(),
                remote: self.remote,
                clock: self.clock,
            }),
        })
    }
}

/// Handle to the data engine.
pub struct StoreManager<B: StorageBackend> {
    shared: Arc<Shared<B>>,
}

impl<B: StorageBackend> Clone for StoreManager<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: StorageBackend> StoreManager<B> {
    /// Build with the system clock, base64 compression and no remote.
    pub fn new(config: EngineConfig, backend: B) -> Result<Self, EngineError> {
        StoreBuilder::new(config, backend).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn namespace(&self) -> &str {
        &self.shared.config.namespace
    }

    /// Configured collection names, in table order.
    pub fn collection_names(&self) -> Vec<String> {
        self.shared
            .config
            .collections
            .iter()
            .map(|spec| spec.name.clone())
            .collect()
    }

    pub fn backend(&self) -> &Arc<B> {
        self.shared.persistence.backend()
    }

    fn now(&self) -> i64 {
        self.shared.clock.now_millis()
    }

    /// Fold the durable copy of `name` into memory on first touch.
    ///
    /// A backend read failure leaves the collection unhydrated, so it is
    /// neither flushed over its durable copy nor mistaken for empty; the
    /// next touch retries.
    async fn hydrate(&self, name: &str) -> Result<(), EngineError> {
        let compressed = {
            let state = self.shared.state.lock();
            let coll = state.collection(name)?;
            if coll.is_hydrated() {
                return Ok(());
            }
            coll.config().compress
        };

        let persisted = match self.shared.persistence.load(name, compressed).await {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!(collection = name, error = %e, "Failed to read persisted collection, will retry");
                return Ok(());
            }
        };
        let now = self.now();

        let mut state = self.shared.state.lock();
        let coll = state.collections.get_mut(name).ok_or_else(|| unknown(name))?;
        if !coll.is_hydrated() {
            let added = coll.merge_persisted(persisted.unwrap_or_default(), now);
            debug!(collection = name, entries = added, "Collection hydrated");
        }
        Ok(())
    }

    async fn hydrate_all(&self) {
        for spec in &self.shared.config.collections {
            if let Err(e) = self.hydrate(&spec.name).await {
                warn!(collection = %spec.name, error = %e, "Hydration failed");
            }
        }
    }

    /// Fold the persisted sync queue and dead letters in, once. Returns
    /// false while the backend cannot be read.
    async fn ensure_sync_restored(&self) -> bool {
        let restored = self
            .shared
            .sync_restored
            .get_or_try_init(|| async {
                let (pending, dead_letters) = self.shared.persistence.load_sync_state().await?;
                if !pending.is_empty() || !dead_letters.is_empty() {
                    info!(
                        pending = pending.len(),
                        dead_letters = dead_letters.len(),
                        "Restored sync operations"
                    );
                }
                self.shared.sync.restore(pending, dead_letters);
                Ok::<(), PersistError>(())
            })
            .await;
        match restored {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Failed to read persisted sync queue, will retry");
                false
            }
        }
    }

    /// Load every persistent collection and the pending sync queue.
    ///
    /// Optional: collections otherwise hydrate lazily on first use.
    pub async fn restore(&self) {
        self.hydrate_all().await;
        self.ensure_sync_restored().await;
        let entries: usize = self
            .shared
            .state
            .lock()
            .collections
            .values()
            .map(Collection::len)
            .sum();
        info!(entries = entries, sync_pending = self.shared.sync.len(), "Store restored");
    }

    /// Store `value` under `key`.
    ///
    /// Validation errors leave everything untouched. Persistence and sync
    /// failures are logged, never returned.
    pub async fn set<V>(
        &self,
        collection: &str,
        key: &str,
        value: &V,
        options: SetOptions,
    ) -> Result<(), EngineError>
    where
        V: Serialize + ?Sized,
    {
        let value = serde_json::to_value(value)?;
        self.hydrate(collection).await?;

        let mutation = {
            let mut state = self.shared.state.lock();
            state.ensure_writable(collection, None)?;
            state.apply_set(collection, key, value, &options, self.now())?
        };
        self.settle(collection, mutation, options.immediate).await;
        Ok(())
    }

    async fn settle(&self, collection: &str, mutation: Mutation, immediate: bool) {
        for op in mutation.sync {
            self.shared.sync.enqueue(op);
        }
        if immediate || mutation.critical {
            if let Err(e) = self.flush_collection(collection).await {
                warn!(collection = collection, error = %e, "Immediate flush skipped");
            }
        }
    }

    pub async fn get_value(&self, collection: &str, key: &str) -> Result<Option<Value>, EngineError> {
        self.hydrate(collection).await?;
        let now = self.now();
        let mut state = self.shared.state.lock();
        state.read(collection, key, now)
    }

    /// Read and deserialize a value. Expired entries read as `None`.
    pub async fn get<T: DeserializeOwned>(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<T>, EngineError> {
        let value = self.get_value(collection, key).await?;
        Ok(value.map(serde_json::from_value).transpose()?)
    }

    pub async fn get_or<T: DeserializeOwned>(
        &self,
        collection: &str,
        key: &str,
        default: T,
    ) -> Result<T, EngineError> {
        Ok(self.get(collection, key).await?.unwrap_or(default))
    }

    /// All live entries of a collection.
    pub async fn get_all(&self, collection: &str) -> Result<BTreeMap<String, Value>, EngineError> {
        self.get_all_where(collection, |_, _| true).await
    }

    pub async fn get_all_where<F>(
        &self,
        collection: &str,
        predicate: F,
    ) -> Result<BTreeMap<String, Value>, EngineError>
    where
        F: FnMut(&str, &Value) -> bool,
    {
        self.hydrate(collection).await?;
        let now = self.now();
        let mut state = self.shared.state.lock();
        state.scan(collection, now, predicate)
    }

    /// Remove `key`. Returns `false`, with no other effect, when it was absent.
    pub async fn delete(&self, collection: &str, key: &str) -> Result<bool, EngineError> {
        self.hydrate(collection).await?;

        let mutation = {
            let mut state = self.shared.state.lock();
            state.ensure_writable(collection, None)?;
            state.apply_delete(collection, key, self.now())?
        };
        match mutation {
            Some(mutation) => {
                self.settle(collection, mutation, false).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove every entry of a collection, returning how many were dropped.
    pub async fn clear(&self, collection: &str) -> Result<usize, EngineError> {
        self.hydrate(collection).await?;

        let (removed, mutation) = {
            let mut state = self.shared.state.lock();
            state.ensure_writable(collection, None)?;
            state.apply_clear(collection, self.now())?
        };
        self.settle(collection, mutation, false).await;
        Ok(removed)
    }

    /// Run `work` against `collections` atomically.
    ///
    /// The collections are snapshotted and locked for the duration. If
    /// `work` returns `Err` (or its future is dropped) every participating
    /// collection is restored from the snapshot and the error is returned;
    /// otherwise the collections are marked dirty and the sync operations
    /// buffered by the handle are queued.
    ///
    /// Fails fast with [`EngineError::ConcurrentTransaction`] if any of the
    /// collections already belongs to an in-flight transaction.
    pub async fn transaction<F, Fut, R, E>(&self, collections: &[&str], work: F) -> Result<R, E>
    where
        F: FnOnce(TxnHandle<B>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<EngineError>,
    {
        let scope: BTreeSet<String> = collections.iter().map(|name| name.to_string()).collect();
        for name in &scope {
            self.hydrate(name).await?;
        }

        let id = {
            let mut state = self.shared.state.lock();
            let mut saved = SavedEntries::new();
            for name in &scope {
                saved.insert(name.clone(), state.collection(name)?.snapshot());
            }
            state.txns.begin(saved)?
        };

        let guard = TxnGuard {
            store: self,
            id,
            armed: true,
        };
        let buffer = Arc::new(Mutex::new(TxnBuffer::default()));
        let handle = TxnHandle {
            store: self.clone(),
            id,
            scope: Arc::new(scope),
            buffer: Arc::clone(&buffer),
        };

        match work(handle).await {
            Ok(value) => {
                guard.disarm();
                {
                    let mut state = self.shared.state.lock();
                    let names = state.txns.commit(id)?;
                    for name in &names {
                        if let Some(coll) = state.collections.get_mut(name) {
                            coll.mark_dirty();
                        }
                    }
                }

                let TxnBuffer { sync, flush } = std::mem::take(&mut *buffer.lock());
                for op in sync {
                    self.shared.sync.enqueue(op);
                }
                for name in flush {
                    if let Err(e) = self.flush_collection(&name).await {
                        warn!(collection = %name, error = %e, "Post-commit flush skipped");
                    }
                }
                Ok(value)
            }
            Err(err) => {
                guard.rollback();
                Err(err)
            }
        }
    }

    fn rollback_txn(&self, id: Uuid) {
        let mut state = self.shared.state.lock();
        if let Err(e) = state.rollback(id) {
            warn!(transaction = %id, error = %e, "Rollback failed");
        }
    }

    /// Drop expired entries from every unlocked collection.
    pub fn purge_expired(&self) -> usize {
        let now = self.now();
        self.shared.state.lock().purge_expired(now)
    }

    fn prepare_job(&self, coll: &Collection) -> Result<Option<FlushJob>, PersistError> {
        // Writing an unhydrated collection would drop its durable entries.
        if !coll.is_hydrated() {
            return Ok(None);
        }
        self.shared.persistence.prepare(coll)
    }

    async fn write_job(&self, job: FlushJob) -> bool {
        match self.shared.persistence.flush(&job).await {
            Ok(()) => {
                let mut state = self.shared.state.lock();
                if let Some(coll) = state.collections.get_mut(&job.collection) {
                    if !coll.mark_clean(job.generation) {
                        debug!(collection = %job.collection, "Collection changed during flush, stays dirty");
                    }
                }
                true
            }
            Err(e) => {
                warn!(collection = %job.collection, error = %e, "Flush failed, collection stays dirty");
                false
            }
        }
    }

    /// Flush one collection if it is persistent, dirty and not locked by a
    /// transaction. Returns whether a write succeeded.
    pub async fn flush_collection(&self, collection: &str) -> Result<bool, EngineError> {
        let job = {
            let state = self.shared.state.lock();
            let coll = state.collection(collection)?;
            if let Some(owner) = state.txns.owner_of(collection) {
                debug!(collection = collection, transaction = %owner, "Flush deferred, collection locked");
                return Ok(false);
            }
            self.prepare_job(coll)
        };

        match job {
            Ok(Some(job)) => Ok(self.write_job(job).await),
            Ok(None) => Ok(false),
            Err(e) => {
                warn!(collection = collection, error = %e, "Failed to encode collection");
                Ok(false)
            }
        }
    }

    /// Flush every dirty persistent collection, then save the sync queue.
    pub async fn flush_all(&self) -> FlushReport {
        let mut report = FlushReport::default();

        let jobs = {
            let state = self.shared.state.lock();
            let mut jobs = Vec::new();
            for spec in &self.shared.config.collections {
                let Some(coll) = state.collections.get(&spec.name) else {
                    continue;
                };
                if !coll.config().persistent || !coll.is_dirty() {
                    continue;
                }
                if state.txns.owner_of(&spec.name).is_some() {
                    report.locked.push(spec.name.clone());
                    continue;
                }
                match self.prepare_job(coll) {
                    Ok(Some(job)) => jobs.push(job),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(collection = %spec.name, error = %e, "Failed to encode collection");
                        report.failed.push(spec.name.clone());
                    }
                }
            }
            jobs
        };

        for job in jobs {
            let name = job.collection.clone();
            if self.write_job(job).await {
                report.flushed.push(name);
            } else {
                report.failed.push(name);
            }
        }

        report.sync_queue_saved = self.save_sync_queue().await;
        report
    }

    async fn save_sync_queue(&self) -> bool {
        // An unrestored queue would overwrite operations saved by an
        // earlier process.
        if !self.ensure_sync_restored().await {
            return false;
        }
        let pending = self.shared.sync.pending();
        let dead_letters = self.shared.sync.dead_letters();
        match self.shared.persistence.save_sync_state(&pending, &dead_letters).await {
            Ok(()) => true,
            Err(e) => {
                warn!(pending = pending.len(), error = %e, "Failed to persist sync queue");
                false
            }
        }
    }

    /// Replay pending sync operations against the remote, if any.
    pub async fn drain_sync(&self) -> DrainReport {
        let Some(remote) = &self.shared.remote else {
            return DrainReport::default();
        };
        // Persisted operations are older and must be replayed first.
        if !self.ensure_sync_restored().await {
            return DrainReport::default();
        }
        self.shared.sync.drain(remote.as_ref()).await
    }

    /// One scheduler cycle: purge expired entries, drain the sync queue,
    /// flush dirty collections.
    pub async fn tick(&self) -> TickReport {
        let purged = self.purge_expired();
        let sync = self.drain_sync().await;
        let flush = self.flush_all().await;
        debug!(
            purged = purged,
            replayed = sync.replayed,
            flushed = flush.flushed.len(),
            failed = flush.failed.len(),
            "Tick finished"
        );
        TickReport { purged, sync, flush }
    }

    /// Write every dirty critical collection without awaiting anything.
    ///
    /// Teardown path only. Collections locked by a transaction are skipped
    /// so a half-applied unit of work never reaches disk. Returns the number
    /// of collections written.
    pub fn emergency_flush(&self) -> usize {
        let jobs: Vec<FlushJob> = {
            let state = self.shared.state.lock();
            self.shared
                .config
                .collections
                .iter()
                .filter_map(|spec| state.collections.get(&spec.name))
                .filter(|coll| coll.config().critical && state.txns.owner_of(coll.name()).is_none())
                .filter_map(|coll| match self.prepare_job(coll) {
                    Ok(job) => job,
                    Err(e) => {
                        warn!(collection = coll.name(), error = %e, "Failed to encode collection");
                        None
                    }
                })
                .collect()
        };

        let mut written = 0;
        for job in jobs {
            match self.shared.persistence.flush_blocking(&job) {
                Ok(()) => {
                    let mut state = self.shared.state.lock();
                    if let Some(coll) = state.collections.get_mut(&job.collection) {
                        coll.mark_clean(job.generation);
                    }
                    written += 1;
                }
                Err(e) => {
                    warn!(collection = %job.collection, error = %e, "Emergency flush failed");
                }
            }
        }

        // An unrestored queue would overwrite operations saved by an
        // earlier process.
        if self.shared.sync_restored.initialized() {
            let pending = self.shared.sync.pending();
            let dead_letters = self.shared.sync.dead_letters();
            if let Err(e) = self
                .shared
                .persistence
                .save_sync_state_blocking(&pending, &dead_letters)
            {
                warn!(pending = pending.len(), error = %e, "Failed to persist sync queue");
            }
        } else if !self.shared.sync.is_empty() {
            warn!(
                pending = self.shared.sync.len(),
                "Sync queue never restored, pending operations not persisted"
            );
        }

        info!(written = written, "Emergency flush finished");
        written
    }

    /// Guard that runs [`emergency_flush`](Self::emergency_flush) when dropped.
    pub fn teardown_guard(&self) -> TeardownGuard<B> {
        TeardownGuard {
            store: self.clone(),
        }
    }

    /// Every collection's live entries plus current stats.
    pub async fn export_snapshot(&self) -> Snapshot {
        self.hydrate_all().await;
        let now = self.now();
        let state = self.shared.state.lock();

        let collections = self
            .shared
            .config
            .collections
            .iter()
            .filter_map(|spec| state.collections.get(&spec.name))
            .map(|coll| {
                let live = coll
                    .entries()
                    .iter()
                    .filter(|(_, entry)| !entry.is_expired(now))
                    .map(|(key, entry)| (key.clone(), entry.clone()))
                    .collect();
                (coll.name().to_string(), live)
            })
            .collect();

        Snapshot {
            namespace: self.shared.config.namespace.clone(),
            exported_at: now,
            collections,
            stats: Some(self.stats_of(&state)),
        }
    }

    /// Bulk-load an exported snapshot, overwriting matching keys and marking
    /// every affected collection dirty. Entries are not queued for sync.
    ///
    /// Every collection name and value is validated first; on error nothing
    /// is applied.
    pub async fn import_snapshot(&self, snapshot: Snapshot) -> Result<ImportReport, EngineError> {
        {
            let state = self.shared.state.lock();
            for name in snapshot.collections.keys() {
                state.ensure_writable(name, None)?;
            }
        }
        for name in snapshot.collections.keys() {
            self.hydrate(name).await?;
        }

        let now = self.now();
        let mut state = self.shared.state.lock();
        for (name, entries) in &snapshot.collections {
            state.ensure_writable(name, None)?;
            let coll = state.collection(name)?;
            for (key, entry) in entries {
                coll.validate(key, &entry.value)?;
            }
        }

        let mut report = ImportReport::default();
        for (name, entries) in snapshot.collections {
            let (live, expired): (BTreeMap<_, _>, BTreeMap<_, _>) =
                entries.into_iter().partition(|(_, entry)| !entry.is_expired(now));
            report.expired_skipped += expired.len();
            report.entries += state.import(&name, live);
            report.collections += 1;
        }

        info!(
            collections = report.collections,
            entries = report.entries,
            expired = report.expired_skipped,
            "Snapshot imported"
        );
        Ok(report)
    }

    fn stats_of(&self, state: &EngineState) -> EngineStats {
        EngineStats {
            namespace: self.shared.config.namespace.clone(),
            backend: self.shared.persistence.backend().name().to_string(),
            collections: self
                .shared
                .config
                .collections
                .iter()
                .filter_map(|spec| state.collections.get(&spec.name))
                .map(Collection::stats)
                .collect(),
            cache: state.cache.stats(),
            transactions: state.txns.stats(),
            sync_pending: self.shared.sync.len(),
            sync_dead_letters: self.shared.sync.dead_letters().len(),
        }
    }

    pub fn stats(&self) -> EngineStats {
        let state = self.shared.state.lock();
        self.stats_of(&state)
    }

    pub fn pending_sync(&self) -> Vec<SyncOperation> {
        self.shared.sync.pending()
    }

    pub fn dead_letters(&self) -> Vec<SyncOperation> {
        self.shared.sync.dead_letters()
    }

    /// Typed view over one collection.
    pub fn collection<T>(&self, name: &str) -> Result<TypedCollection<B, T>, EngineError>
    where
        T: Serialize + DeserializeOwned,
    {
        self.shared.state.lock().collection(name)?;
        Ok(TypedCollection::new(self.clone(), name))
    }
}

impl<B: StorageBackend + 'static> StoreManager<B> {
    /// Run [`tick`](Self::tick) every `flush_interval_ms` on the current
    /// tokio runtime.
    pub fn spawn_scheduler(&self) -> SchedulerHandle {
        let (shutdown, mut signal) = watch::channel(false);
        let store = self.clone();
        let period = self.shared.config.flush_interval();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        store.tick().await;
                    }
                    changed = signal.changed() => {
                        if changed.is_err() || *signal.borrow() {
                            break;
                        }
                    }
                }
            }

            store.emergency_flush();
            info!("Scheduler stopped");
        });

        info!(interval_ms = period.as_millis() as u64, "Scheduler started");
        SchedulerHandle { shutdown, task }
    }
}

/// Stops the background scheduler.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal the scheduler, wait for the in-flight tick and the final
    /// emergency flush.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Scheduler task failed");
        }
    }
}

/// Runs an emergency flush when dropped.
pub struct TeardownGuard<B: StorageBackend> {
    store: StoreManager<B>,
}

impl<B: StorageBackend> Drop for TeardownGuard<B> {
    fn drop(&mut self) {
        self.store.emergency_flush();
    }
}

/// Rolls the transaction back unless disarmed, so a cancelled unit of
/// work cannot keep its collections locked.
struct TxnGuard<'a, B: StorageBackend> {
    store: &'a StoreManager<B>,
    id: Uuid,
    armed: bool,
}

impl<B: StorageBackend> TxnGuard<'_, B> {
    fn disarm(mut self) {
        self.armed = false;
    }

    fn rollback(mut self) {
        self.armed = false;
        self.store.rollback_txn(self.id);
    }
}

impl<B: StorageBackend> Drop for TxnGuard<'_, B> {
    fn drop(&mut self) {
        if self.armed {
            warn!(transaction = %self.id, "Transaction abandoned, rolling back");
            self.store.rollback_txn(self.id);
        }
    }
}

#[derive(Default)]
struct TxnBuffer {
    sync: Vec<SyncOperation>,
    /// Collections to flush right after commit.
    flush: BTreeSet<String>,
}

/// Access to the collections of one in-flight transaction.
///
/// Operations are synchronous: participating collections are hydrated
/// before the transaction starts.
pub struct TxnHandle<B: StorageBackend> {
    store: StoreManager<B>,
    id: Uuid,
    scope: Arc<BTreeSet<String>>,
    buffer: Arc<Mutex<TxnBuffer>>,
}

impl<B: StorageBackend> Clone for TxnHandle<B> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            id: self.id,
            scope: Arc::clone(&self.scope),
            buffer: Arc::clone(&self.buffer),
        }
    }
}

impl<B: StorageBackend> TxnHandle<B> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.scope.iter().map(String::as_str)
    }

    fn check_scope(&self, collection: &str) -> Result<(), EngineError> {
        if self.scope.contains(collection) {
            Ok(())
        } else {
            Err(EngineError::NotInTransaction(collection.to_string()))
        }
    }

    pub fn get<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Result<Option<T>, EngineError> {
        self.check_scope(collection)?;
        let now = self.store.now();
        let value = {
            let mut state = self.store.shared.state.lock();
            state.ensure_writable(collection, Some(self.id))?;
            state.read(collection, key, now)?
        };
        Ok(value.map(serde_json::from_value).transpose()?)
    }

    pub fn get_all(&self, collection: &str) -> Result<BTreeMap<String, Value>, EngineError> {
        self.check_scope(collection)?;
        let now = self.store.now();
        let mut state = self.store.shared.state.lock();
        state.ensure_writable(collection, Some(self.id))?;
        state.scan(collection, now, |_, _| true)
    }

    pub fn set<V: Serialize + ?Sized>(&self, collection: &str, key: &str, value: &V) -> Result<(), EngineError> {
        self.set_with(collection, key, value, SetOptions::default())
    }

    /// `options.immediate` defers the flush to commit.
    pub fn set_with<V: Serialize + ?Sized>(
        &self,
        collection: &str,
        key: &str,
        value: &V,
        options: SetOptions,
    ) -> Result<(), EngineError> {
        self.check_scope(collection)?;
        let value = serde_json::to_value(value)?;
        let now = self.store.now();
        let mutation = {
            let mut state = self.store.shared.state.lock();
            state.ensure_writable(collection, Some(self.id))?;
            state.apply_set(collection, key, value, &options, now)?
        };
        self.record(collection, mutation, options.immediate);
        Ok(())
    }

    pub fn delete(&self, collection: &str, key: &str) -> Result<bool, EngineError> {
        self.check_scope(collection)?;
        let now = self.store.now();
        let mutation = {
            let mut state = self.store.shared.state.lock();
            state.ensure_writable(collection, Some(self.id))?;
            state.apply_delete(collection, key, now)?
        };
        Ok(match mutation {
            Some(mutation) => {
                self.record(collection, mutation, false);
                true
            }
            None => false,
        })
    }

    fn record(&self, collection: &str, mutation: Mutation, immediate: bool) {
        let mut buffer = self.buffer.lock();
        buffer.sync.extend(mutation.sync);
        if immediate || mutation.critical {
            buffer.flush.insert(collection.to_string());
        }
    }
}
