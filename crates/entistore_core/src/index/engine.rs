//! Index engine: owns the declared indexes and keeps them in step with
//! entity writes.
//!
//! Entities are indexed through their JSON-shaped form. The engine is the
//! only writer of index logs; the entity log stays the source of truth, and
//! any index can be rebuilt from it.

use super::log::IndexLog;
use super::secondary::Index;
use super::value::IndexDefinition;
use crate::entity::EntityId;
use crate::error::{CoreError, CoreResult};
use crate::record::EntityStore;
use crate::toc::TableOfContents;
use entistore_codec::EntitySerializer;
use entistore_storage::BufferPool;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

/// File extension of index logs.
pub const INDEX_LOG_EXTENSION: &str = "idx";

/// Outcome of [`IndexEngine::open`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexOpenReport {
    /// Indexes that started from an empty log and need a backfill.
    pub pending_backfill: Vec<String>,
}

/// All secondary indexes of one engine.
#[derive(Debug, Default)]
pub struct IndexEngine {
    indexes: Vec<Index>,
}

impl IndexEngine {
    /// Opens the declared indexes.
    ///
    /// With `dir`, each index logs to `<dir>/<name>.idx`; without it the logs
    /// live in memory.
    ///
    /// # Errors
    ///
    /// Fails on duplicate names, invalid definitions or unreadable logs.
    pub fn open(
        definitions: &[IndexDefinition],
        dir: Option<&Path>,
        pool: &BufferPool,
    ) -> CoreResult<(Self, IndexOpenReport)> {
        let mut names = HashSet::new();
        let mut indexes = Vec::with_capacity(definitions.len());
        let mut report = IndexOpenReport::default();

        for definition in definitions {
            if !names.insert(definition.name.as_str()) {
                return Err(CoreError::invalid_operation(format!(
                    "index {} is declared twice",
                    definition.name
                )));
            }
            definition.validate()?;
            let path = dir.map(|d| d.join(format!("{}.{INDEX_LOG_EXTENSION}", definition.name)));
            let log = IndexLog::open(path.as_deref(), pool.clone())?;
            let (index, backfill) = Index::open(definition.clone(), log)?;
            if backfill {
                report.pending_backfill.push(definition.name.clone());
            }
            indexes.push(index);
        }

        Ok((Self { indexes }, report))
    }

    /// Returns true if no index is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    /// Returns the number of indexes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    /// Looks up an index by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Index> {
        self.indexes.iter().find(|i| i.name() == name)
    }

    /// Iterates the indexes in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Index> {
        self.indexes.iter()
    }

    /// Converts an entity into the form index paths are resolved against.
    ///
    /// Returns `None` when no index is declared, or when the entity has no
    /// JSON form (it is then indexed as owning no values).
    pub fn document<T: Serialize + ?Sized>(&self, entity: &T) -> Option<JsonValue> {
        if self.indexes.is_empty() {
            return None;
        }
        match serde_json::to_value(entity) {
            Ok(document) => Some(document),
            Err(e) => {
                warn!(error = %e, "entity has no JSON form; it will not be indexed");
                Some(JsonValue::Null)
            }
        }
    }

    /// Indexes `document` as the current state of `id`.
    ///
    /// Every index is updated even if an earlier one fails; the first
    /// failure is returned.
    pub fn upsert(&self, id: EntityId, document: &JsonValue) -> CoreResult<()> {
        self.each(|index| index.upsert(id, index.definition().extract(document)))
    }

    /// Drops `id` from every index, with the same failure handling as
    /// [`upsert`](Self::upsert).
    pub fn remove(&self, id: EntityId) -> CoreResult<()> {
        self.each(|index| index.remove(id).map(drop))
    }

    fn each<F>(&self, mut apply: F) -> CoreResult<()>
    where
        F: FnMut(&Index) -> CoreResult<()>,
    {
        let mut first = None;
        for index in &self.indexes {
            if let Err(e) = apply(index) {
                warn!(index = %index.name(), error = %e, "index update failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Fills the named indexes from the active records of `store`.
    ///
    /// Records whose payload does not decode are logged and left out.
    /// Returns the number of entities indexed.
    pub fn backfill(
        &self,
        names: &[String],
        store: &EntityStore,
        toc: &TableOfContents,
    ) -> CoreResult<usize> {
        let targets: Vec<&Index> = self
            .indexes
            .iter()
            .filter(|i| names.iter().any(|n| n == i.name()))
            .collect();
        if targets.is_empty() || toc.is_empty() {
            return Ok(0);
        }

        let serializer = store.serializer();
        let mut indexed = 0usize;
        store.read_all(|header, payload| {
            let current = match header.key() {
                Some(key) if !header.is_free() => toc
                    .try_get(&key)
                    .filter(|e| e.offset == header.offset)
                    .map(|_| key),
                _ => None,
            };
            let Some(key) = current else {
                return payload.skip();
            };

            let bytes = payload.read_to_vec()?;
            match serializer.deserialize::<JsonValue>(&bytes) {
                Ok(document) => {
                    for index in &targets {
                        index.upsert(key, index.definition().extract(&document))?;
                    }
                    indexed += 1;
                }
                Err(e) => warn!(entity = %key, error = %e, "cannot index undecodable payload"),
            }
            Ok(())
        })?;

        info!(indexes = ?names, entities = indexed, "backfilled indexes");
        Ok(indexed)
    }

    /// Drops owners that are not active in `toc`.
    ///
    /// Index logs are written after the entity log, so after a crash they
    /// may name entities the log no longer holds.
    pub fn retain_active(&self, toc: &TableOfContents) -> CoreResult<usize> {
        let mut dropped = 0usize;
        for index in &self.indexes {
            for owner in index.owners() {
                if !toc.contains(&owner) && index.remove(owner)? {
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            warn!(dropped, "dropped index entries for entities missing from the log");
        }
        Ok(dropped)
    }

    /// Compacts every index log.
    pub fn compact_all(&self) -> CoreResult<()> {
        for index in &self.indexes {
            index.compact_log()?;
        }
        debug!(indexes = self.indexes.len(), "compacted index logs");
        Ok(())
    }
}
