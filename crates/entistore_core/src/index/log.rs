//! Index mutation log.
//!
//! Each index persists its state as an append-only sequence of entries:
//!
//! ```text
//! entry    := len u32 | kind u8 | body        (len counts kind and body)
//! metadata := version u32 | path str | value_type str | capabilities u8
//! mutation := op u8 | entity_id [16] | text str   (text only for Add)
//! str      := len u32 | utf8
//! ```
//!
//! The first entry is always the metadata entry. Replaying the mutations in
//! order reproduces the in-memory index exactly.

use super::value::{Capabilities, IndexDefinition, ValueType};
use crate::entity::{EntityId, ENTITY_ID_LEN};
use crate::error::{CoreError, CoreResult};
use entistore_storage::{
    BufferPool, FileBackend, InMemoryBackend, ReadBuffer, StorageBackend, WriteBuffer,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Current index log version.
pub const INDEX_LOG_VERSION: u32 = 1;

const KIND_METADATA: u8 = 1;
const KIND_MUTATION: u8 = 2;
const OP_ADD: u8 = 1;
const OP_REMOVE: u8 = 2;
const LOG_CAPACITY: usize = 16 * 1024;

/// First entry of an index log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMetadata {
    /// Log format version.
    pub version: u32,
    /// Field path the index was built from.
    pub path: String,
    /// Declared value type.
    pub value_type: ValueType,
    /// Capability flags.
    pub capabilities: Capabilities,
}

impl IndexMetadata {
    /// Metadata describing `definition`.
    #[must_use]
    pub fn for_definition(definition: &IndexDefinition) -> Self {
        Self {
            version: INDEX_LOG_VERSION,
            path: definition.path.clone(),
            value_type: definition.value_type,
            capabilities: definition.capabilities,
        }
    }
}

/// One persisted change to an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexMutation {
    /// The entity owns a value with this text form.
    Add {
        /// Owning entity.
        entity_id: EntityId,
        /// Text form of the value.
        text: String,
    },
    /// The entity owns no values.
    Remove {
        /// Entity whose values are dropped.
        entity_id: EntityId,
    },
}

enum Entry {
    Metadata(IndexMetadata),
    Mutation(IndexMutation),
}

/// Append-only log backing one index.
pub struct IndexLog {
    backend: Arc<dyn StorageBackend>,
    pool: BufferPool,
    /// `None` for in-memory logs.
    path: Option<PathBuf>,
    end: u64,
}

impl IndexLog {
    /// Opens the log at `path`, or an in-memory log when `path` is `None`.
    pub fn open(path: Option<&Path>, pool: BufferPool) -> CoreResult<Self> {
        let backend: Arc<dyn StorageBackend> = match path {
            Some(path) => Arc::new(FileBackend::open_with_create_dirs(path)?),
            None => Arc::new(InMemoryBackend::new()),
        };
        Self::with_backend(backend, pool, path.map(Path::to_path_buf))
    }

    /// Wraps an already opened backend; `path` is where rewrites go.
    pub(crate) fn with_backend(
        backend: Arc<dyn StorageBackend>,
        pool: BufferPool,
        path: Option<PathBuf>,
    ) -> CoreResult<Self> {
        let end = backend.size()?;
        Ok(Self {
            backend,
            pool,
            path,
            end,
        })
    }

    /// Returns the log length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end
    }

    /// Returns true if the log holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end == 0
    }

    /// Discards the log and starts it with `metadata`.
    pub fn create(&mut self, metadata: &IndexMetadata) -> CoreResult<()> {
        self.backend.truncate(0)?;
        self.end = 0;
        self.end = write_entries(&self.backend, &self.pool, 0, Some(metadata), &[])?;
        self.backend.flush()?;
        Ok(())
    }

    /// Replays the log, feeding each mutation to `apply`.
    ///
    /// Returns the metadata, or `None` for an empty log. An incomplete
    /// entry at the end is cut off.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InitializationFailed`] when the first entry is
    /// not metadata or an entry cannot be decoded.
    pub fn replay<F>(&mut self, apply: F) -> CoreResult<Option<IndexMetadata>>
    where
        F: FnMut(IndexMutation) -> CoreResult<()>,
    {
        let replayed = self.replay_entries(apply);
        // A cut tail moves the append position back.
        self.end = self.backend.size()?;
        replayed
    }

    fn replay_entries<F>(&self, mut apply: F) -> CoreResult<Option<IndexMetadata>>
    where
        F: FnMut(IndexMutation) -> CoreResult<()>,
    {
        let size = self.backend.size()?;
        let mut reader = ReadBuffer::new(
            Arc::clone(&self.backend),
            &self.pool,
            0,
            size,
            LOG_CAPACITY,
        );

        let metadata = match self.read_entry(&mut reader)? {
            None => return Ok(None),
            Some(Entry::Metadata(metadata)) => metadata,
            Some(Entry::Mutation(_)) => {
                return Err(CoreError::initialization_failed(
                    "index log does not start with a metadata entry",
                ))
            }
        };

        let mut mutations = 0usize;
        while let Some(entry) = self.read_entry(&mut reader)? {
            match entry {
                Entry::Mutation(m) => {
                    apply(m)?;
                    mutations += 1;
                }
                Entry::Metadata(_) => {
                    return Err(CoreError::initialization_failed(
                        "index log holds a second metadata entry",
                    ))
                }
            }
        }
        debug!(path = ?self.path, mutations, "replayed index log");
        Ok(Some(metadata))
    }

    /// Appends mutations.
    pub fn append(&mut self, mutations: &[IndexMutation]) -> CoreResult<()> {
        if mutations.is_empty() {
            return Ok(());
        }
        match write_entries(&self.backend, &self.pool, self.end, None, mutations) {
            Ok(end) => {
                self.end = end;
                self.backend.flush()?;
                Ok(())
            }
            Err(e) => {
                if let Err(cut) = self.backend.truncate(self.end) {
                    warn!(error = %cut, "could not cut partial index log entry");
                }
                Err(e)
            }
        }
    }

    /// Replaces the log with `metadata` followed by `mutations`.
    ///
    /// File logs are written beside the original and renamed over it.
    pub fn rewrite(&mut self, metadata: &IndexMetadata, mutations: &[IndexMutation]) -> CoreResult<()> {
        let Some(path) = self.path.clone() else {
            let backend: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
            self.end = write_entries(&backend, &self.pool, 0, Some(metadata), mutations)?;
            self.backend = backend;
            return Ok(());
        };

        let temp = path.with_extension("idx.tmp");
        if temp.exists() {
            fs::remove_file(&temp)?;
        }
        {
            let backend: Arc<dyn StorageBackend> = Arc::new(FileBackend::open(&temp)?);
            write_entries(&backend, &self.pool, 0, Some(metadata), mutations)?;
            backend.sync()?;
        }
        fs::rename(&temp, &path)?;

        let backend = Arc::new(FileBackend::open(&path)?);
        self.end = backend.size()?;
        self.backend = backend;
        Ok(())
    }

    fn read_entry(&self, reader: &mut ReadBuffer) -> CoreResult<Option<Entry>> {
        if reader.is_at_end() {
            return Ok(None);
        }
        let start = reader.position();
        let len = if reader.remaining() >= 4 {
            u64::from(reader.read_u32_le()?)
        } else {
            u64::MAX
        };
        if len == 0 || len > reader.remaining() {
            warn!(path = ?self.path, offset = start, "cutting incomplete index log entry");
            self.backend.truncate(start)?;
            return Ok(None);
        }

        let body_start = reader.position();
        let kind = reader.read_byte()?;
        let entry = match kind {
            KIND_METADATA => Entry::Metadata(IndexMetadata {
                version: reader.read_u32_le()?,
                path: read_str(reader)?,
                value_type: ValueType::from_name(&read_str(reader)?)?,
                capabilities: Capabilities::from_byte(reader.read_byte()?),
            }),
            KIND_MUTATION => {
                let op = reader.read_byte()?;
                let entity_id = EntityId::from_bytes(reader.read_bytes::<ENTITY_ID_LEN>()?);
                match op {
                    OP_ADD => Entry::Mutation(IndexMutation::Add {
                        entity_id,
                        text: read_str(reader)?,
                    }),
                    OP_REMOVE => Entry::Mutation(IndexMutation::Remove { entity_id }),
                    other => {
                        return Err(CoreError::initialization_failed(format!(
                            "unknown index mutation {other} at offset {start}"
                        )))
                    }
                }
            }
            other => {
                return Err(CoreError::initialization_failed(format!(
                    "unknown index log entry kind {other} at offset {start}"
                )))
            }
        };

        let consumed = reader.position() - body_start;
        if consumed != len {
            return Err(CoreError::initialization_failed(format!(
                "index log entry at offset {start} declares {len} bytes, decoded {consumed}"
            )));
        }
        Ok(Some(entry))
    }
}

impl std::fmt::Debug for IndexLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexLog")
            .field("path", &self.path)
            .field("end", &self.end)
            .finish_non_exhaustive()
    }
}

fn write_entries(
    backend: &Arc<dyn StorageBackend>,
    pool: &BufferPool,
    start: u64,
    metadata: Option<&IndexMetadata>,
    mutations: &[IndexMutation],
) -> CoreResult<u64> {
    let mut writer = WriteBuffer::new(Arc::clone(backend), pool, start, LOG_CAPACITY);
    if let Some(metadata) = metadata {
        let len = writer.reserve(4)?;
        writer.write_byte(KIND_METADATA)?;
        writer.write_u32_le(metadata.version)?;
        write_str(&mut writer, &metadata.path)?;
        write_str(&mut writer, metadata.value_type.name())?;
        writer.write_byte(metadata.capabilities.as_byte())?;
        writer.apply_length(len)?;
    }
    for mutation in mutations {
        let len = writer.reserve(4)?;
        writer.write_byte(KIND_MUTATION)?;
        match mutation {
            IndexMutation::Add { entity_id, text } => {
                writer.write_byte(OP_ADD)?;
                writer.write(entity_id.as_bytes())?;
                write_str(&mut writer, text)?;
            }
            IndexMutation::Remove { entity_id } => {
                writer.write_byte(OP_REMOVE)?;
                writer.write(entity_id.as_bytes())?;
            }
        }
        writer.apply_length(len)?;
    }
    Ok(writer.finish()?)
}

fn write_str(writer: &mut WriteBuffer, s: &str) -> CoreResult<()> {
    let len = writer.reserve(4)?;
    writer.write(s.as_bytes())?;
    writer.apply_length(len)?;
    Ok(())
}

fn read_str(reader: &mut ReadBuffer) -> CoreResult<String> {
    let len = reader.read_u32_le()? as usize;
    if len as u64 > reader.remaining() {
        return Err(CoreError::initialization_failed(format!(
            "string of {len} bytes overruns the index log"
        )));
    }
    String::from_utf8(reader.read_vec(len)?)
        .map_err(|e| CoreError::initialization_failed(format!("index log string: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn metadata() -> IndexMetadata {
        IndexMetadata::for_definition(&IndexDefinition::text("by_title", "title"))
    }

    fn add(n: u8, text: &str) -> IndexMutation {
        IndexMutation::Add {
            entity_id: EntityId::from_bytes([n; 16]),
            text: text.to_owned(),
        }
    }

    fn replay_all(log: &mut IndexLog) -> (Option<IndexMetadata>, Vec<IndexMutation>) {
        let mut seen = Vec::new();
        let meta = log
            .replay(|m| {
                seen.push(m);
                Ok(())
            })
            .unwrap();
        (meta, seen)
    }

    #[test]
    fn empty_log_has_no_metadata() {
        let mut log = IndexLog::open(None, BufferPool::shared().clone()).unwrap();
        assert!(log.is_empty());
        assert_eq!(replay_all(&mut log), (None, vec![]));
    }

    #[test]
    fn replay_returns_metadata_and_mutations_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("indexes").join("by_title.idx");
        let mutations = vec![
            add(1, "Dune"),
            add(2, "Emma"),
            IndexMutation::Remove {
                entity_id: EntityId::from_bytes([1; 16]),
            },
        ];
        {
            let mut log = IndexLog::open(Some(&path), BufferPool::shared().clone()).unwrap();
            log.create(&metadata()).unwrap();
            log.append(&mutations[..2]).unwrap();
            log.append(&mutations[2..]).unwrap();
        }

        let mut log = IndexLog::open(Some(&path), BufferPool::shared().clone()).unwrap();
        assert_eq!(replay_all(&mut log), (Some(metadata()), mutations));
    }

    #[test]
    fn log_must_start_with_metadata() {
        let mut log = IndexLog::open(None, BufferPool::shared().clone()).unwrap();
        log.append(&[add(1, "x")]).unwrap();
        let err = log.replay(|_| Ok(())).unwrap_err();
        assert!(matches!(err, CoreError::InitializationFailed { .. }));
    }

    #[test]
    fn incomplete_tail_is_cut() {
        let mut log = IndexLog::open(None, BufferPool::shared().clone()).unwrap();
        log.create(&metadata()).unwrap();
        log.append(&[add(1, "kept")]).unwrap();
        let good = log.len();
        log.backend.append(&[40, 0, 0, 0, KIND_MUTATION]).unwrap();

        let (meta, seen) = replay_all(&mut log);
        assert_eq!(meta, Some(metadata()));
        assert_eq!(seen, vec![add(1, "kept")]);
        assert_eq!(log.backend.size().unwrap(), good);
        assert_eq!(log.len(), good);
    }

    #[test]
    fn append_after_cut_tail_continues_the_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("by_title.idx");
        {
            let mut log = IndexLog::open(Some(&path), BufferPool::shared().clone()).unwrap();
            log.create(&metadata()).unwrap();
            log.append(&[add(1, "kept")]).unwrap();
            log.backend.append(&[40, 0, 0]).unwrap();
        }

        let mut log = IndexLog::open(Some(&path), BufferPool::shared().clone()).unwrap();
        let (_, seen) = replay_all(&mut log);
        assert_eq!(seen, vec![add(1, "kept")]);
        log.append(&[add(2, "after")]).unwrap();

        let mut reopened = IndexLog::open(Some(&path), BufferPool::shared().clone()).unwrap();
        assert_eq!(
            replay_all(&mut reopened),
            (Some(metadata()), vec![add(1, "kept"), add(2, "after")])
        );
    }

    #[test]
    fn torn_metadata_leaves_an_empty_log() {
        let mut log = IndexLog::open(None, BufferPool::shared().clone()).unwrap();
        log.backend.append(&[60, 0, 0, 0, KIND_METADATA]).unwrap();
        assert_eq!(replay_all(&mut log), (None, vec![]));
        assert!(log.is_empty());
        log.create(&metadata()).unwrap();
        log.append(&[add(4, "fresh")]).unwrap();
        assert_eq!(replay_all(&mut log).1, vec![add(4, "fresh")]);
    }

    #[test]
    fn rewrite_replaces_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("by_title.idx");
        let mut log = IndexLog::open(Some(&path), BufferPool::shared().clone()).unwrap();
        log.create(&metadata()).unwrap();
        for n in 0..20 {
            log.append(&[add(n, "churn")]).unwrap();
            log.append(&[IndexMutation::Remove {
                entity_id: EntityId::from_bytes([n; 16]),
            }])
            .unwrap();
        }
        let before = log.len();

        log.rewrite(&metadata(), &[add(7, "final")]).unwrap();
        assert!(log.len() < before);
        assert!(!path.with_extension("idx.tmp").exists());

        let mut reopened = IndexLog::open(Some(&path), BufferPool::shared().clone()).unwrap();
        assert_eq!(
            replay_all(&mut reopened),
            (Some(metadata()), vec![add(7, "final")])
        );
        log.append(&[add(8, "after")]).unwrap();
    }

    #[test]
    fn large_text_crosses_buffer_boundary() {
        let mut log = IndexLog::open(None, BufferPool::shared().clone()).unwrap();
        log.create(&metadata()).unwrap();
        let text = "x".repeat(LOG_CAPACITY * 2 + 17);
        log.append(&[add(3, &text)]).unwrap();
        let (_, seen) = replay_all(&mut log);
        assert_eq!(seen, vec![add(3, &text)]);
    }
}
