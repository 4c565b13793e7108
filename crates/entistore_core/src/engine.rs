//! Engine facade.
//!
//! The [`Engine`] ties the entity log, the table of contents, the lock
//! manager and the secondary indexes together:
//!
//! - Opening is cheap: [`Engine::open`] only takes the directory lock. The
//!   log scan, TOC rebuild and index replay run once, on a blocking thread,
//!   the first time an operation needs them.
//! - Every operation holds the store gate shared; [`Engine::shrink`] and
//!   [`Engine::close`] hold it exclusively, so reads and writes wait while
//!   the log is being compacted.
//! - Writes to one entity are serialized by its key lock; appends to the log
//!   are serialized by the append lock. An operation finishes all of its
//!   lock waits before it touches the log, so a cancelled or timed-out call
//!   has no effect.
//!
//! # Example
//!
//! ```rust,no_run
//! use entistore_core::{Config, Engine, IndexDefinition};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Book {
//!     title: String,
//!     year: i64,
//! }
//!
//! # async fn run() -> entistore_core::CoreResult<()> {
//! let config = Config::new().index(IndexDefinition::text("title", "title"));
//! let engine = Engine::open("library", config)?;
//!
//! let id = engine
//!     .add(&Book { title: "Dune".into(), year: 1965 })
//!     .await?;
//! let book: Option<Book> = engine.get(id).await?;
//! let hits = engine.query::<Book>("title").full_text("dune", 1).await?;
//!
//! engine.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::change_feed::{ChangeEvent, ChangeFeed, ChangeType};
use crate::config::Config;
use crate::dir::EngineDir;
use crate::entity::EntityId;
use crate::error::{CoreError, CoreResult};
use crate::index::{Index, IndexEngine, IndexValue};
use crate::lock::{LockManager, SharedGate};
use crate::record::{EntityStore, RecordMetadata, ScanSummary, PREFIX_LEN, STORE_HEADER_LEN};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::toc::{TableOfContents, TocEntry, TocSource};
use entistore_codec::{EntitySerializer, Serializer};
use entistore_storage::{BufferPool, FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::Mutex;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::marker::PhantomData;
use std::ops::{Bound, RangeBounds};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where the entity log lives.
enum Source {
    Dir(EngineDir),
    Backend(Arc<dyn StorageBackend>),
}

/// Everything built by initialization.
struct State {
    store: EntityStore,
    toc: TableOfContents,
    indexes: IndexEngine,
    /// Cleared when an index update fails after its write was committed.
    indexes_in_step: AtomicBool,
}

impl State {
    /// Index names a saved snapshot may vouch for.
    fn current_indexes(&self) -> Vec<String> {
        if self.indexes_in_step.load(Ordering::Acquire) {
            self.indexes.iter().map(|i| i.name().to_owned()).collect()
        } else {
            Vec::new()
        }
    }
}

struct EngineInner {
    config: Config,
    source: Source,
    pool: BufferPool,
    locks: LockManager,
    feed: ChangeFeed,
    stats: EngineStats,
    /// Cancelled by close; aborts every pending lock wait.
    shutdown: CancellationToken,
    closed: AtomicBool,
    state: OnceCell<Result<Arc<State>, String>>,
    /// Serializes initialization attempts whose callers went away.
    init_lock: Mutex<()>,
}

/// Outcome of [`Engine::shrink`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShrinkReport {
    /// Records moved toward the start of the log.
    pub records_moved: usize,
    /// Log length before shrinking.
    pub bytes_before: u64,
    /// Log length after shrinking.
    pub bytes_after: u64,
    /// Bytes released.
    pub bytes_reclaimed: u64,
}

/// Outcome of [`Engine::verify`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Log scan summary.
    pub scan: ScanSummary,
    /// Log length in bytes.
    pub store_len: u64,
    /// Active entities.
    pub active: usize,
    /// Bytes held by active records.
    pub active_bytes: u64,
    /// Active entities whose payload does not decode.
    pub undecodable: Vec<EntityId>,
    /// Active entities whose record was not found where the TOC points.
    pub missing: Vec<EntityId>,
}

impl VerifyReport {
    /// Returns true if nothing is corrupt, torn, undecodable or missing.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.scan.corrupt == 0
            && self.scan.torn_tail.is_none()
            && self.undecodable.is_empty()
            && self.missing.is_empty()
    }

    /// Returns the bytes shrink would release.
    #[must_use]
    pub fn reclaimable_bytes(&self) -> u64 {
        self.store_len
            .saturating_sub(STORE_HEADER_LEN + self.active_bytes)
    }
}

/// Handle to an entity store.
///
/// Cloning is cheap; clones share the same store.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Opens the engine stored in the directory at `path`.
    ///
    /// Only the directory lock is taken here; the store itself is loaded by
    /// the first operation (or by [`ready`](Self::ready)).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseLocked`] if another process holds the
    /// directory, or an error if the directory is missing and
    /// `create_if_missing` is false.
    pub fn open(path: impl AsRef<Path>, config: Config) -> CoreResult<Self> {
        let dir = EngineDir::open(path.as_ref(), config.create_if_missing)?;
        Ok(Self::with_source(Source::Dir(dir), config))
    }

    /// Opens an engine whose entity log and index logs live in memory.
    #[must_use]
    pub fn open_in_memory(config: Config) -> Self {
        Self::open_with_backend(Arc::new(InMemoryBackend::new()), config)
    }

    /// Opens an engine over a caller-supplied entity log backend.
    ///
    /// Index logs live in memory and are rebuilt from the log at open.
    #[must_use]
    pub fn open_with_backend(backend: Arc<dyn StorageBackend>, config: Config) -> Self {
        Self::with_source(Source::Backend(backend), config)
    }

    fn with_source(source: Source, config: Config) -> Self {
        let pool = config
            .buffer_pool
            .clone()
            .map_or_else(|| BufferPool::shared().clone(), BufferPool::new);
        Self {
            inner: Arc::new(EngineInner {
                locks: LockManager::new(config.lock_timeout),
                feed: ChangeFeed::with_max_history(config.change_history),
                stats: EngineStats::new(),
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
                state: OnceCell::new(),
                init_lock: Mutex::new(()),
                pool,
                source,
                config,
            }),
        }
    }

    /// Loads the store if it has not been loaded yet.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InitializationFailed`] if the store cannot be
    /// loaded; every later call fails the same way.
    pub async fn ready(&self) -> CoreResult<()> {
        self.state().await.map(drop)
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Returns true until [`close`](Self::close) is called.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    async fn state(&self) -> CoreResult<Arc<State>> {
        if !self.is_open() {
            return Err(CoreError::EngineClosed);
        }
        let result = self
            .inner
            .state
            .get_or_init(|| async {
                let inner = Arc::clone(&self.inner);
                match tokio::task::spawn_blocking(move || inner.initialize()).await {
                    Ok(Ok(state)) => Ok(Arc::new(state)),
                    Ok(Err(e)) => Err(e.into_init_message()),
                    Err(e) => Err(format!("initialization task failed: {e}")),
                }
            })
            .await;
        match result {
            Ok(state) => Ok(Arc::clone(state)),
            Err(message) => Err(CoreError::initialization_failed(message.clone())),
        }
    }

    /// Loads the store and enters the gate shared.
    async fn enter(&self) -> CoreResult<(Arc<State>, SharedGate)> {
        let state = self.state().await?;
        let gate = self.inner.locks.enter_shared(&self.inner.shutdown).await?;
        if !self.is_open() {
            return Err(CoreError::EngineClosed);
        }
        Ok((state, gate))
    }

    fn track<T>(&self, result: CoreResult<T>) -> CoreResult<T> {
        if let Err(e) = &result {
            self.inner.stats.record_error();
            debug!(error = %e, "engine operation failed");
        }
        result
    }

    /// Stores `entity` under a fresh id.
    pub async fn add<T: Serialize + ?Sized>(&self, entity: &T) -> CoreResult<EntityId> {
        let id = EntityId::generate();
        self.add_with_id(id, entity).await?;
        Ok(id)
    }

    /// Stores `entity` under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AlreadyExists`] if `id` is active.
    pub async fn add_with_id<T: Serialize + ?Sized>(&self, id: EntityId, entity: &T) -> CoreResult<()> {
        let result = self.write(id, entity, ChangeType::Added).await;
        self.track(result)
    }

    /// Replaces the entity stored under `id` and bumps its version.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if `id` is not active.
    pub async fn update<T: Serialize + ?Sized>(&self, id: EntityId, entity: &T) -> CoreResult<()> {
        let result = self.write(id, entity, ChangeType::Updated).await;
        self.track(result)
    }

    async fn write<T: Serialize + ?Sized>(
        &self,
        id: EntityId,
        entity: &T,
        change: ChangeType,
    ) -> CoreResult<()> {
        let inner = &self.inner;
        let (state, _gate) = self.enter().await?;
        let _entity = inner.locks.enter_entity_write(id, &inner.shutdown).await?;

        let previous = state.toc.try_get(&id);
        let version = match (change, previous) {
            (ChangeType::Added, None) => 1,
            (ChangeType::Added, Some(_)) => return Err(CoreError::AlreadyExists { entity_id: id }),
            (_, Some(old)) => old.version.wrapping_add(1),
            (_, None) => return Err(CoreError::NotFound { entity_id: id }),
        };
        let payload = state.store.serializer().serialize(entity)?;
        let document = state.indexes.document(entity);

        let append = inner.locks.enter_append(&inner.shutdown).await?;
        let location = state
            .store
            .append(&RecordMetadata::new(id, version), &payload)?;
        drop(append);

        // Committed from here on: later failures are logged and counted but
        // the write still completes and is reported.
        state
            .toc
            .upsert(TocEntry::active(id, location.offset, location.size, version));
        if let Some(old) = previous {
            // A superseded record left active is freed by the next rebuild.
            if let Err(e) = state.store.mark_free(old.offset) {
                inner.stats.record_error();
                error!(entity = %id, offset = old.offset, error = %e, "could not free superseded record");
            }
        }
        if let Some(document) = &document {
            if let Err(e) = state.indexes.upsert(id, document) {
                self.indexes_fell_behind(&state, id, &e);
            }
        }

        let bytes = u64::from(location.size);
        match change {
            ChangeType::Added => inner.stats.record_add(bytes),
            _ => inner.stats.record_update(bytes),
        }
        inner.feed.publish(id, change, Some(payload));
        Ok(())
    }

    /// Deletes the entity stored under `id`.
    ///
    /// Returns false, and does nothing, if `id` is not active.
    pub async fn delete(&self, id: EntityId) -> CoreResult<bool> {
        let result = self.delete_inner(id).await;
        self.track(result)
    }

    async fn delete_inner(&self, id: EntityId) -> CoreResult<bool> {
        let inner = &self.inner;
        let (state, _gate) = self.enter().await?;
        let _entity = inner.locks.enter_entity_write(id, &inner.shutdown).await?;

        let Some(old) = state.toc.try_get(&id) else {
            return Ok(false);
        };
        state.store.mark_free(old.offset)?;
        state.toc.remove(&id);
        if let Err(e) = state.indexes.remove(id) {
            self.indexes_fell_behind(&state, id, &e);
        }

        inner.stats.record_delete();
        inner.feed.publish(id, ChangeType::Deleted, None);
        Ok(true)
    }

    /// Records an index update that failed after its entity write was
    /// committed. The indexes are re-derived from the log at the next open.
    fn indexes_fell_behind(&self, state: &State, id: EntityId, e: &CoreError) {
        self.inner.stats.record_error();
        state.indexes_in_step.store(false, Ordering::Release);
        error!(entity = %id, error = %e, "index update failed after commit; indexes rebuild at next open");
    }

    /// Reads the entity stored under `id`.
    pub async fn get<T: DeserializeOwned>(&self, id: EntityId) -> CoreResult<Option<T>> {
        let result = self.get_inner(id).await;
        self.track(result)
    }

    async fn get_inner<T: DeserializeOwned>(&self, id: EntityId) -> CoreResult<Option<T>> {
        let (state, payload) = match self.read_payload(id).await? {
            Some(found) => found,
            None => return Ok(None),
        };
        Ok(Some(state.store.serializer().deserialize(&payload)?))
    }

    /// Reads the serialized payload stored under `id`.
    pub async fn get_raw(&self, id: EntityId) -> CoreResult<Option<Vec<u8>>> {
        let result = self.read_payload(id).await;
        self.track(result.map(|found| found.map(|(_, payload)| payload)))
    }

    async fn read_payload(&self, id: EntityId) -> CoreResult<Option<(Arc<State>, Vec<u8>)>> {
        let inner = &self.inner;
        let (state, _gate) = self.enter().await?;
        let _entity = inner.locks.enter_entity_read(id, &inner.shutdown).await?;

        let Some(entry) = state.toc.try_get(&id) else {
            return Ok(None);
        };
        let (_, payload) = state.store.read_payload(entry.offset, id)?;
        inner.stats.record_read(payload.len() as u64);
        Ok(Some((state, payload)))
    }

    /// Returns true if `id` is active.
    pub async fn contains(&self, id: EntityId) -> CoreResult<bool> {
        Ok(self.state().await?.toc.contains(&id))
    }

    /// Returns the number of active entities.
    pub async fn len(&self) -> CoreResult<usize> {
        Ok(self.state().await?.toc.len())
    }

    /// Returns true if no entity is active.
    pub async fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Returns the active entity ids, sorted.
    pub async fn ids(&self) -> CoreResult<Vec<EntityId>> {
        Ok(self.state().await?.toc.keys())
    }

    /// Returns the active TOC entries in log order.
    pub async fn entries(&self) -> CoreResult<Vec<TocEntry>> {
        Ok(self.state().await?.toc.snapshot_sorted())
    }

    /// Returns the payload serializer of the store.
    pub async fn serializer(&self) -> CoreResult<Serializer> {
        Ok(self.state().await?.store.serializer())
    }

    /// Returns the length of the entity log in bytes.
    pub async fn store_len(&self) -> CoreResult<u64> {
        Ok(self.state().await?.store.len())
    }

    /// Returns the operation counters.
    pub async fn stats(&self) -> CoreResult<StatsSnapshot> {
        let state = self.state().await?;
        Ok(StatsSnapshot {
            entity_count: state.toc.len() as u64,
            ..self.inner.stats.snapshot()
        })
    }

    /// Starts a query against the index named `index`.
    pub fn query<T: DeserializeOwned>(&self, index: &str) -> Query<'_, T> {
        Query {
            engine: self,
            index: index.to_owned(),
            _marker: PhantomData,
        }
    }

    async fn lookup<F>(&self, name: &str, find: F) -> CoreResult<Vec<EntityId>>
    where
        F: FnOnce(&Index) -> Vec<EntityId>,
    {
        let (state, _gate) = self.enter().await?;
        let index = state
            .indexes
            .get(name)
            .ok_or_else(|| CoreError::invalid_operation(format!("no index named {name}")))?;
        self.inner.stats.record_index_lookup();
        Ok(find(index))
    }

    async fn materialize<T: DeserializeOwned>(
        &self,
        ids: Vec<EntityId>,
    ) -> CoreResult<Vec<(EntityId, T)>> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            // Deleted since the lookup.
            if let Some(entity) = self.get_inner(id).await? {
                found.push((id, entity));
            }
        }
        Ok(found)
    }

    /// Subscribes to change events.
    pub fn subscribe(&self) -> UnboundedReceiver<ChangeEvent> {
        self.inner.feed.subscribe()
    }

    /// Returns up to `limit` recent events with a sequence above `cursor`.
    #[must_use]
    pub fn poll_changes(&self, cursor: u64, limit: usize) -> Vec<ChangeEvent> {
        self.inner.feed.poll(cursor, limit)
    }

    /// Rewrites the log so that active records are contiguous.
    ///
    /// Reads and writes wait until shrink finishes. Afterwards the log is
    /// exactly the store header followed by the active records, and every
    /// index log is compacted. A record too large for the free gap below it
    /// is first parked at the end of the log, so it ends up after the
    /// records that followed it.
    ///
    /// Each record move becomes visible with a single prefix write, so a
    /// crash mid-way leaves a log that rebuilds to the same entities.
    pub async fn shrink(&self) -> CoreResult<ShrinkReport> {
        let result = self.shrink_inner().await;
        self.track(result)
    }

    async fn shrink_inner(&self) -> CoreResult<ShrinkReport> {
        let inner = &self.inner;
        let state = self.state().await?;
        let _gate = inner.locks.enter_exclusive(&inner.shutdown).await?;
        let _append = inner.locks.enter_append(&inner.shutdown).await?;
        if !self.is_open() {
            return Err(CoreError::EngineClosed);
        }

        let store = &state.store;
        let bytes_before = store.len();
        let mut next = STORE_HEADER_LEN;
        let mut records_moved = 0usize;
        let mut queue: VecDeque<(TocEntry, bool)> = state
            .toc
            .snapshot_sorted()
            .into_iter()
            .map(|entry| (entry, false))
            .collect();
        while let Some((entry, staged)) = queue.pop_front() {
            let size = u64::from(entry.size);
            let gap = entry.offset.checked_sub(next).ok_or_else(|| {
                CoreError::corrupt_record(entry.offset, "record overlaps the one before it")
            })?;
            if gap == 0 {
                next += size;
                continue;
            }
            if gap >= size + PREFIX_LEN as u64 {
                store.move_record(entry.offset, next, size)?;
                state.toc.upsert(TocEntry {
                    offset: next,
                    ..entry
                });
                records_moved += 1;
                next += size;
            } else if !staged {
                // Too little room to move in place without touching the
                // original; park a copy at the end and free the original.
                let copy = store.relocate_to_end(entry.offset, size)?;
                let parked = TocEntry {
                    offset: copy.offset,
                    ..entry
                };
                state.toc.upsert(parked);
                store.mark_free(entry.offset)?;
                queue.push_back((parked, true));
            } else {
                warn!(key = %entry.key, offset = entry.offset, gap, "record left in place by shrink");
                next = entry.offset + size;
            }
        }
        store.truncate(next)?;
        store.sync()?;
        state.indexes.compact_all()?;

        let bytes_after = store.len();
        let report = ShrinkReport {
            records_moved,
            bytes_before,
            bytes_after,
            bytes_reclaimed: bytes_before.saturating_sub(bytes_after),
        };
        inner.stats.record_shrink(report.bytes_reclaimed);
        info!(
            records_moved,
            bytes_before,
            bytes_after,
            "shrank entity log"
        );
        Ok(report)
    }

    /// Scans the whole log and checks it against the TOC.
    ///
    /// Holds the gate exclusively, like [`shrink`](Self::shrink).
    pub async fn verify(&self) -> CoreResult<VerifyReport> {
        let result = self.verify_inner().await;
        self.track(result)
    }

    async fn verify_inner(&self) -> CoreResult<VerifyReport> {
        let inner = &self.inner;
        let state = self.state().await?;
        let _gate = inner.locks.enter_exclusive(&inner.shutdown).await?;

        let serializer = state.store.serializer();
        let mut seen = HashSet::new();
        let mut undecodable = Vec::new();
        let scan = state.store.read_all(|header, payload| {
            let current = match header.key() {
                Some(key) if !header.is_free() => state
                    .toc
                    .try_get(&key)
                    .filter(|e| e.offset == header.offset)
                    .map(|_| key),
                _ => None,
            };
            let Some(key) = current else {
                return payload.skip();
            };
            seen.insert(key);
            let bytes = payload.read_to_vec()?;
            if serializer.deserialize::<IgnoredAny>(&bytes).is_err() {
                undecodable.push(key);
            }
            Ok(())
        })?;

        let missing: Vec<EntityId> = state
            .toc
            .keys()
            .into_iter()
            .filter(|key| !seen.contains(key))
            .collect();
        let report = VerifyReport {
            scan,
            store_len: state.store.len(),
            active: state.toc.len(),
            active_bytes: state.toc.active_bytes(),
            undecodable,
            missing,
        };
        if !report.is_healthy() {
            warn!(
                corrupt = report.scan.corrupt,
                torn_tail = ?report.scan.torn_tail,
                undecodable = report.undecodable.len(),
                missing = report.missing.len(),
                "verification found problems"
            );
        }
        Ok(report)
    }

    /// Closes the engine.
    ///
    /// Pending lock waits fail with [`CoreError::Cancelled`]; operations
    /// already past their waits finish first. The log is synced and, with
    /// `persist_toc`, the TOC is saved so the next open can skip the scan.
    /// Later calls fail with [`CoreError::EngineClosed`]. Closing twice is a
    /// no-op.
    pub async fn close(&self) -> CoreResult<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        inner.shutdown.cancel();

        let state = match inner.state.get() {
            Some(Ok(state)) => Arc::clone(state),
            _ => {
                inner.feed.close();
                return Ok(());
            }
        };
        let _gate = inner.locks.enter_exclusive(&CancellationToken::new()).await?;
        state.store.sync()?;
        if inner.config.persist_toc {
            if let Source::Dir(dir) = &inner.source {
                let snapshot = state
                    .toc
                    .encode_snapshot(state.store.len(), &state.current_indexes());
                dir.save_toc_snapshot(&snapshot)?;
            }
        }
        inner.feed.close();
        info!(entities = state.toc.len(), "closed engine");
        Ok(())
    }
}

impl EngineInner {
    fn initialize(&self) -> CoreResult<State> {
        let _serial = self.init_lock.lock();

        let (backend, snapshot, index_dir) = match &self.source {
            Source::Dir(dir) => {
                let backend: Arc<dyn StorageBackend> =
                    Arc::new(FileBackend::open(&dir.entity_path())?);
                (backend, dir.take_toc_snapshot()?, Some(dir.indexes_dir()))
            }
            Source::Backend(backend) => (Arc::clone(backend), None, None),
        };

        let store = EntityStore::open(
            backend,
            self.pool.clone(),
            self.config.serializer,
            self.config.sync_on_write,
        )?;
        let (toc, rebuild) = TableOfContents::create_or_rebuild(&store, snapshot.as_deref())?;
        let (indexes, opened) =
            IndexEngine::open(&self.config.indexes, index_dir.as_deref(), &self.pool)?;

        // After an unclean close the index logs may lag or lead the entity
        // log, so every index is re-derived from the records. Otherwise only
        // indexes the snapshot does not vouch for are: new ones, and ones a
        // previous session did not declare or failed to update.
        let rebuilt = rebuild.source == TocSource::Rebuilt;
        let pending: Vec<String> = self
            .config
            .indexes
            .iter()
            .map(|d| &d.name)
            .filter(|name| {
                rebuilt
                    || opened.pending_backfill.contains(name)
                    || !rebuild.current_indexes.contains(name)
            })
            .cloned()
            .collect();
        indexes.retain_active(&toc)?;
        if !pending.is_empty() {
            indexes.backfill(&pending, &store, &toc)?;
        }

        info!(
            serializer = %store.serializer(),
            entities = rebuild.active,
            healed = rebuild.healed,
            source = ?rebuild.source,
            indexes = indexes.len(),
            "opened entity store"
        );
        Ok(State {
            store,
            toc,
            indexes,
            indexes_in_step: AtomicBool::new(true),
        })
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let path = match &self.inner.source {
            Source::Dir(dir) => Some(dir.path().to_path_buf()),
            Source::Backend(_) => None,
        };
        f.debug_struct("Engine")
            .field("path", &path)
            .field("open", &self.is_open())
            .field("initialized", &self.inner.state.initialized())
            .finish_non_exhaustive()
    }
}

/// Index query returning entities of type `T`.
///
/// Created by [`Engine::query`]. Naming an index that is not declared fails
/// with [`CoreError::InvalidOperation`]; a lookup the index lacks the
/// capability for returns nothing.
pub struct Query<'a, T> {
    engine: &'a Engine,
    index: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Query<'_, T> {
    /// Ids of entities owning `value`.
    pub async fn seek_ids(&self, value: impl Into<IndexValue>) -> CoreResult<Vec<EntityId>> {
        let value = value.into();
        let result = self.engine.lookup(&self.index, |i| i.seek(&value)).await;
        self.engine.track(result)
    }

    /// Entities owning `value`.
    pub async fn seek(&self, value: impl Into<IndexValue>) -> CoreResult<Vec<(EntityId, T)>> {
        let ids = self.seek_ids(value).await?;
        let result = self.engine.materialize(ids).await;
        self.engine.track(result)
    }

    /// Ids of entities owning a value in `range`, ordered by value.
    pub async fn range_ids<R: RangeBounds<IndexValue>>(&self, range: R) -> CoreResult<Vec<EntityId>> {
        let result = self
            .engine
            .lookup(&self.index, |i| i.range(range.start_bound(), range.end_bound()))
            .await;
        self.engine.track(result)
    }

    /// Entities owning a value in `range`, ordered by value.
    pub async fn range<R: RangeBounds<IndexValue>>(&self, range: R) -> CoreResult<Vec<(EntityId, T)>> {
        let ids = self.range_ids(range).await?;
        let result = self.engine.materialize(ids).await;
        self.engine.track(result)
    }

    /// Ids of entities whose text matches every token of `query`.
    pub async fn full_text_ids(&self, query: &str, tolerance: usize) -> CoreResult<Vec<EntityId>> {
        let result = self
            .engine
            .lookup(&self.index, |i| i.full_text_search(query, tolerance))
            .await;
        self.engine.track(result)
    }

    /// Entities whose text matches every token of `query`.
    pub async fn full_text(&self, query: &str, tolerance: usize) -> CoreResult<Vec<(EntityId, T)>> {
        let ids = self.full_text_ids(query, tolerance).await?;
        let result = self.engine.materialize(ids).await;
        self.engine.track(result)
    }

    /// Ids of every entity indexed with at least one value, ordered by value.
    pub async fn all_ids(&self) -> CoreResult<Vec<EntityId>> {
        let result = self
            .engine
            .lookup(&self.index, |i| i.range(Bound::Unbounded, Bound::Unbounded))
            .await;
        self.engine.track(result)
    }
}
