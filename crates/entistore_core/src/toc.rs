//! Table of contents: entity key to record location.
//!
//! The TOC is derivable from the entity log. On a clean close it is saved as
//! a snapshot tagged with the log length it describes; at open the snapshot
//! is replayed only if that length still matches, otherwise the TOC is
//! rebuilt with one scan of the log. The snapshot also names the indexes
//! that were kept in step with the log, so an index left behind by a
//! session that did not declare it is backfilled at the next open.
//!
//! ## Snapshot format
//!
//! ```text
//! magic "ETOC" | version u16 | store_len u64 | count u32
//! count × ( key [16] | offset u64 | size u32 | version u32 )
//! index_count u16
//! index_count × ( len u16 | name utf8 )
//! ```

use crate::entity::{EntityId, ENTITY_ID_LEN};
use crate::error::{CoreError, CoreResult};
use crate::record::{EntityStore, ScanSummary, STORE_HEADER_LEN};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Magic bytes of a TOC snapshot.
pub const TOC_MAGIC: [u8; 4] = *b"ETOC";

/// Current TOC snapshot version.
pub const TOC_VERSION: u16 = 2;

const SNAPSHOT_HEADER_LEN: usize = 4 + 2 + 8 + 4;
const SNAPSHOT_ENTRY_LEN: usize = ENTITY_ID_LEN + 8 + 4 + 4;

/// Location of an entity's record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TocEntry {
    /// Entity key.
    pub key: EntityId,
    /// Offset of the record in the entity log.
    pub offset: u64,
    /// Total length of the record.
    pub size: u32,
    /// Whether the record has been freed.
    pub is_free: bool,
    /// Entity version stored in the record.
    pub version: u32,
}

impl TocEntry {
    /// Creates an entry for an active record.
    #[must_use]
    pub const fn active(key: EntityId, offset: u64, size: u32, version: u32) -> Self {
        Self {
            key,
            offset,
            size,
            is_free: false,
            version,
        }
    }
}

/// Decoded TOC snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocSnapshot {
    /// Log length the snapshot describes.
    pub store_len: u64,
    /// Active entries.
    pub entries: Vec<TocEntry>,
    /// Indexes that matched the log when the snapshot was taken.
    pub current_indexes: Vec<String>,
}

/// Where a TOC came from at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TocSource {
    /// Replayed from a saved snapshot.
    Snapshot,
    /// Rebuilt by scanning the entity log.
    Rebuilt,
}

/// Outcome of [`TableOfContents::create_or_rebuild`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    /// How the TOC was produced.
    pub source: TocSource,
    /// Active entries.
    pub active: usize,
    /// Earlier duplicate records that were marked free.
    pub healed: usize,
    /// Log scan summary, present when rebuilt.
    pub scan: Option<ScanSummary>,
    /// Indexes the replayed snapshot vouches for; empty when rebuilt.
    pub current_indexes: Vec<String>,
}

/// In-memory directory of active records.
///
/// Holds at most one entry per key; all operations run under one mutex.
#[derive(Debug, Default)]
pub struct TableOfContents {
    entries: Mutex<HashMap<EntityId, TocEntry>>,
}

impl TableOfContents {
    /// Creates an empty TOC.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Produces the TOC for `store`.
    ///
    /// A `snapshot` is used only when it decodes and describes a log of the
    /// store's current length. An incomplete record at the end of the log is
    /// cut off.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InitializationFailed`] when the log cannot be
    /// scanned.
    pub fn create_or_rebuild(
        store: &EntityStore,
        snapshot: Option<&[u8]>,
    ) -> CoreResult<(Self, RebuildReport)> {
        if let Some(data) = snapshot {
            match Self::decode_snapshot(data) {
                Ok(snapshot) if snapshot.store_len == store.len() => {
                    let active = snapshot.entries.len();
                    debug!(
                        active,
                        indexes = ?snapshot.current_indexes,
                        "replayed table of contents snapshot"
                    );
                    let toc = Self::new();
                    toc.entries
                        .lock()
                        .extend(snapshot.entries.into_iter().map(|e| (e.key, e)));
                    return Ok((
                        toc,
                        RebuildReport {
                            source: TocSource::Snapshot,
                            active,
                            healed: 0,
                            scan: None,
                            current_indexes: snapshot.current_indexes,
                        },
                    ));
                }
                Ok(snapshot) => {
                    debug!(
                        snapshot_len = snapshot.store_len,
                        store_len = store.len(),
                        "table of contents snapshot is stale"
                    );
                }
                Err(e) => warn!(error = %e, "ignoring unreadable table of contents snapshot"),
            }
        }

        Self::rebuild(store)
            .map_err(|e| CoreError::initialization_failed(format!("rebuilding table of contents: {e}")))
    }

    /// Rebuilds the TOC with one scan of the log.
    ///
    /// The last active record of a key wins; earlier active records of the
    /// same key are marked free. Free records never enter the TOC.
    pub fn rebuild(store: &EntityStore) -> CoreResult<(Self, RebuildReport)> {
        let mut entries: HashMap<EntityId, TocEntry> = HashMap::new();
        let mut superseded = Vec::new();

        let scan = store.read_all(|header, payload| {
            payload.skip()?;
            let (false, Some(metadata)) = (header.is_free(), header.metadata) else {
                return Ok(());
            };
            let size = u32::try_from(header.size())
                .map_err(|_| CoreError::corrupt_record(header.offset, "record too large"))?;
            let entry = TocEntry::active(metadata.key, header.offset, size, metadata.version);
            if let Some(previous) = entries.insert(metadata.key, entry) {
                superseded.push(previous);
            }
            Ok(())
        })?;

        if let Some(offset) = scan.torn_tail {
            warn!(offset, "cutting incomplete record off the end of the log");
            store.truncate(scan.end)?;
        }

        for previous in &superseded {
            warn!(
                key = %previous.key,
                offset = previous.offset,
                "freeing superseded record left active"
            );
            store.mark_free(previous.offset)?;
        }

        let report = RebuildReport {
            source: TocSource::Rebuilt,
            active: entries.len(),
            healed: superseded.len(),
            scan: Some(scan),
            current_indexes: Vec::new(),
        };
        info!(
            active = report.active,
            records = scan.records,
            free = scan.free,
            corrupt = scan.corrupt,
            healed = report.healed,
            "rebuilt table of contents"
        );

        Ok((
            Self {
                entries: Mutex::new(entries),
            },
            report,
        ))
    }

    /// Looks up the entry for `key`.
    #[must_use]
    pub fn try_get(&self, key: &EntityId) -> Option<TocEntry> {
        self.entries.lock().get(key).copied()
    }

    /// Returns true if `key` has an entry.
    #[must_use]
    pub fn contains(&self, key: &EntityId) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Inserts or replaces the entry for `entry.key`, returning the old one.
    pub fn upsert(&self, entry: TocEntry) -> Option<TocEntry> {
        self.entries.lock().insert(entry.key, entry)
    }

    /// Removes the entry for `key`.
    pub fn remove(&self, key: &EntityId) -> Option<TocEntry> {
        self.entries.lock().remove(key)
    }

    /// Returns all entries ordered by offset.
    #[must_use]
    pub fn snapshot_sorted(&self) -> Vec<TocEntry> {
        let mut entries: Vec<TocEntry> = self.entries.lock().values().copied().collect();
        entries.sort_unstable_by_key(|e| e.offset);
        entries
    }

    /// Returns all keys in ascending order.
    #[must_use]
    pub fn keys(&self) -> Vec<EntityId> {
        let mut keys: Vec<EntityId> = self.entries.lock().keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Returns the summed size of all active records.
    #[must_use]
    pub fn active_bytes(&self) -> u64 {
        self.entries
            .lock()
            .values()
            .map(|e| u64::from(e.size))
            .sum()
    }

    /// Encodes a snapshot describing a log of `store_len` bytes whose
    /// indexes named in `current_indexes` are up to date.
    #[must_use]
    pub fn encode_snapshot(&self, store_len: u64, current_indexes: &[String]) -> Vec<u8> {
        let entries = self.snapshot_sorted();
        let mut buf = Vec::with_capacity(SNAPSHOT_HEADER_LEN + entries.len() * SNAPSHOT_ENTRY_LEN);

        buf.extend_from_slice(&TOC_MAGIC);
        buf.extend_from_slice(&TOC_VERSION.to_le_bytes());
        buf.extend_from_slice(&store_len.to_le_bytes());
        let count = u32::try_from(entries.len()).unwrap_or(u32::MAX);
        buf.extend_from_slice(&count.to_le_bytes());

        for entry in entries.iter().take(count as usize) {
            buf.extend_from_slice(entry.key.as_bytes());
            buf.extend_from_slice(&entry.offset.to_le_bytes());
            buf.extend_from_slice(&entry.size.to_le_bytes());
            buf.extend_from_slice(&entry.version.to_le_bytes());
        }

        // Names that do not fit are left out; their indexes get backfilled.
        let names: Vec<&[u8]> = current_indexes
            .iter()
            .map(String::as_bytes)
            .filter(|name| u16::try_from(name.len()).is_ok())
            .take(usize::from(u16::MAX))
            .collect();
        buf.extend_from_slice(&(names.len() as u16).to_le_bytes());
        for name in names {
            buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
            buf.extend_from_slice(name);
        }

        buf
    }

    /// Decodes a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidFormat`] when the snapshot is truncated,
    /// has another version, or names a record outside the log it describes.
    pub fn decode_snapshot(data: &[u8]) -> CoreResult<TocSnapshot> {
        if data.len() < SNAPSHOT_HEADER_LEN || data[0..4] != TOC_MAGIC {
            return Err(CoreError::invalid_format("invalid snapshot magic"));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != TOC_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported snapshot version {version}"
            )));
        }
        let store_len = u64::from_le_bytes(le_array(&data[6..14]));
        let count = u32::from_le_bytes(le_array(&data[14..18])) as usize;

        let body = &data[SNAPSHOT_HEADER_LEN..];
        let entries_len = count
            .checked_mul(SNAPSHOT_ENTRY_LEN)
            .filter(|len| *len <= body.len())
            .ok_or_else(|| {
                CoreError::invalid_format(format!(
                    "snapshot holds {} bytes, too few for {count} entries",
                    body.len()
                ))
            })?;
        let (raw_entries, mut trailer) = body.split_at(entries_len);

        let mut entries = Vec::with_capacity(count);
        for raw in raw_entries.chunks_exact(SNAPSHOT_ENTRY_LEN) {
            let key = EntityId::from_bytes(le_array(&raw[..16]));
            let offset = u64::from_le_bytes(le_array(&raw[16..24]));
            let size = u32::from_le_bytes(le_array(&raw[24..28]));
            let version = u32::from_le_bytes(le_array(&raw[28..32]));
            let outside = offset < STORE_HEADER_LEN
                || offset
                    .checked_add(u64::from(size))
                    .is_none_or(|end| end > store_len);
            if outside {
                return Err(CoreError::invalid_format(format!(
                    "snapshot entry {key} lies outside the log"
                )));
            }
            entries.push(TocEntry::active(key, offset, size, version));
        }

        let index_count = take_u16(&mut trailer)?;
        let mut current_indexes = Vec::with_capacity(usize::from(index_count));
        for _ in 0..index_count {
            let len = usize::from(take_u16(&mut trailer)?);
            if trailer.len() < len {
                return Err(CoreError::invalid_format("snapshot index name is truncated"));
            }
            let (name, rest) = trailer.split_at(len);
            let name = std::str::from_utf8(name)
                .map_err(|e| CoreError::invalid_format(format!("snapshot index name: {e}")))?;
            current_indexes.push(name.to_owned());
            trailer = rest;
        }
        if !trailer.is_empty() {
            return Err(CoreError::invalid_format(format!(
                "snapshot has {} trailing bytes",
                trailer.len()
            )));
        }

        Ok(TocSnapshot {
            store_len,
            entries,
            current_indexes,
        })
    }
}

fn take_u16(data: &mut &[u8]) -> CoreResult<u16> {
    if data.len() < 2 {
        return Err(CoreError::invalid_format("snapshot is truncated"));
    }
    let (head, rest) = data.split_at(2);
    *data = rest;
    Ok(u16::from_le_bytes([head[0], head[1]]))
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}
