//! The entity log.

use super::header::{
    RecordHeader, RecordMetadata, RecordPrefix, StoreHeader, MARKER_FREE, MARKER_IN_USE,
    METADATA_FILLER, PREFIX_LEN, STORE_HEADER_LEN,
};
use crate::entity::EntityId;
use crate::error::{CoreError, CoreResult};
use entistore_codec::Serializer;
use entistore_storage::{BufferPool, ReadBuffer, StorageBackend, WriteBuffer};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const READ_CAPACITY: usize = 4 * 1024;
const SCAN_CAPACITY: usize = 64 * 1024;
const WRITE_CAPACITY: usize = 64 * 1024;

/// Outcome of a full scan of the entity log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Well-formed records visited (in use and free).
    pub records: u64,
    /// Records visited whose marker is free.
    pub free: u64,
    /// Corrupt records that were skipped.
    pub corrupt: u64,
    /// Offset of an incomplete record at the end of the log, if any.
    pub torn_tail: Option<u64>,
    /// Offset where the scan stopped.
    pub end: u64,
}

/// Location of a record written by [`EntityStore::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLocation {
    /// Offset of the record.
    pub offset: u64,
    /// Total length of the record.
    pub size: u32,
}

/// The writes of an in-place record move, in the order they reach the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MoveStep {
    /// One filler covers the whole free gap below the record.
    CoverGap,
    /// Prefix of the filler that will follow the copy, hidden inside the
    /// gap filler.
    TrailingFiller,
    /// Metadata and payload of the copy, hidden inside the gap filler.
    Body,
    /// Prefix of the copy: the copy becomes visible and the trailing
    /// filler hides the original.
    Prefix,
}

impl MoveStep {
    pub(crate) const ALL: [Self; 4] = [
        Self::CoverGap,
        Self::TrailingFiller,
        Self::Body,
        Self::Prefix,
    ];
}

/// Payload cursor handed to [`EntityStore::read_all`] visitors.
///
/// A visitor must consume or skip the whole payload.
pub struct PayloadReader<'a> {
    reader: &'a mut ReadBuffer,
    remaining: u64,
}

impl PayloadReader<'_> {
    /// Returns the number of payload bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Reads the rest of the payload.
    pub fn read_to_vec(&mut self) -> CoreResult<Vec<u8>> {
        let len = usize::try_from(self.remaining)
            .map_err(|_| CoreError::invalid_operation("payload larger than address space"))?;
        let out = self.reader.read_vec(len)?;
        self.remaining = 0;
        Ok(out)
    }

    /// Fills `dest` from the payload.
    pub fn read_exact(&mut self, dest: &mut [u8]) -> CoreResult<()> {
        if dest.len() as u64 > self.remaining {
            return Err(CoreError::invalid_operation(format!(
                "read of {} bytes with {} payload bytes left",
                dest.len(),
                self.remaining
            )));
        }
        self.reader.copy_into(dest)?;
        self.remaining -= dest.len() as u64;
        Ok(())
    }

    /// Skips the rest of the payload.
    pub fn skip(&mut self) -> CoreResult<()> {
        self.reader.advance(self.remaining)?;
        self.remaining = 0;
        Ok(())
    }
}

/// Append-only log of framed records.
///
/// The store knows record framing and nothing about keys beyond the
/// metadata block. Offset allocation is not synchronized here: callers
/// serialize [`append`](Self::append) through the engine's append lock.
pub struct EntityStore {
    backend: Arc<dyn StorageBackend>,
    pool: BufferPool,
    header: StoreHeader,
    /// Next append offset.
    end: AtomicU64,
    /// End of the last completed write.
    written: AtomicU64,
    /// Flushed-through watermark.
    flushed: Mutex<u64>,
    sync_on_write: bool,
}

impl EntityStore {
    /// Opens a store, writing the header if the backend is empty.
    ///
    /// An existing store keeps the serializer recorded in its header;
    /// `serializer` only applies to new stores.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::InitializationFailed`] when the header is
    /// missing, truncated or names an unknown serializer.
    pub fn open(
        backend: Arc<dyn StorageBackend>,
        pool: BufferPool,
        serializer: Serializer,
        sync_on_write: bool,
    ) -> CoreResult<Self> {
        let size = backend.size()?;
        let header = if size == 0 {
            let header = StoreHeader::new(serializer);
            backend.append(&header.encode())?;
            backend.flush()?;
            if sync_on_write {
                backend.sync()?;
            }
            debug!(serializer = %serializer, "created store header");
            header
        } else {
            let len = size.min(STORE_HEADER_LEN) as usize;
            let header = StoreHeader::decode(&backend.read_at(0, len)?)?;
            if header.serializer != serializer {
                debug!(
                    stored = %header.serializer,
                    requested = %serializer,
                    "store keeps the serializer from its header"
                );
            }
            header
        };

        let end = backend.size()?;
        Ok(Self {
            backend,
            pool,
            header,
            end: AtomicU64::new(end),
            written: AtomicU64::new(end),
            flushed: Mutex::new(end),
            sync_on_write,
        })
    }

    /// Returns the store header.
    #[must_use]
    pub fn header(&self) -> StoreHeader {
        self.header
    }

    /// Returns the payload serializer.
    #[must_use]
    pub fn serializer(&self) -> Serializer {
        self.header.serializer
    }

    /// Returns the length of the log in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end.load(Ordering::Acquire)
    }

    /// Returns true if the log holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() <= STORE_HEADER_LEN
    }

    /// Starts a record at `offset` and returns a cursor at the payload.
    ///
    /// The caller writes exactly `payload_len` bytes and finishes the cursor.
    /// `offset` must be the current end of the log.
    pub fn write(
        &self,
        offset: u64,
        payload_len: usize,
        metadata: &RecordMetadata,
    ) -> CoreResult<WriteBuffer> {
        let metadata_length = RecordMetadata::encoded_len(metadata.metadata_version)
            .filter(|_| metadata.metadata_version != METADATA_FILLER)
            .ok_or_else(|| {
                CoreError::invalid_operation(format!(
                    "cannot write metadata v{}",
                    metadata.metadata_version
                ))
            })?;
        let total = PREFIX_LEN + metadata_length as usize + payload_len;
        let total_length = i32::try_from(total).map_err(|_| {
            CoreError::invalid_operation(format!("record of {total} bytes is too large"))
        })?;

        let mut writer = WriteBuffer::new(
            Arc::clone(&self.backend),
            &self.pool,
            offset,
            total.min(WRITE_CAPACITY),
        );
        RecordPrefix {
            marker: MARKER_IN_USE,
            total_length,
            metadata_version: metadata.metadata_version,
            metadata_length,
        }
        .write_to(&mut writer)?;
        metadata.write_to(&mut writer)?;
        Ok(writer)
    }

    /// Appends a record at the end of the log.
    ///
    /// Must be called with the append lock held.
    pub fn append(&self, metadata: &RecordMetadata, payload: &[u8]) -> CoreResult<RecordLocation> {
        let offset = self.len();
        let mut writer = self.write(offset, payload.len(), metadata)?;
        writer.write(payload)?;
        let end = writer.finish()?;

        let size = u32::try_from(end - offset)
            .map_err(|_| CoreError::invalid_operation("record length overflow"))?;
        self.end.store(end, Ordering::Release);
        self.written.fetch_max(end, Ordering::AcqRel);
        if self.sync_on_write {
            self.sync()?;
        }
        Ok(RecordLocation { offset, size })
    }

    /// Flushes pending writes if any lie below or at `offset`.
    pub fn ensure_flushed(&self, offset: u64) -> CoreResult<()> {
        let mut flushed = self.flushed.lock();
        if *flushed > offset {
            return Ok(());
        }
        let written = self.written.load(Ordering::Acquire);
        if *flushed < written {
            self.backend.flush()?;
            *flushed = written;
        }
        Ok(())
    }

    /// Reads the header at `offset` and returns a cursor at its payload.
    pub fn read(&self, offset: u64) -> CoreResult<(RecordHeader, ReadBuffer)> {
        self.ensure_flushed(offset)?;
        let limit = self.len();
        if offset < STORE_HEADER_LEN || offset.saturating_add(PREFIX_LEN as u64) > limit {
            return Err(CoreError::corrupt_record(
                offset,
                format!("offset outside the log (length {limit})"),
            ));
        }

        let mut reader = ReadBuffer::new(
            Arc::clone(&self.backend),
            &self.pool,
            offset,
            limit,
            READ_CAPACITY,
        );
        let header = RecordPrefix::read_from(&mut reader)?.finish(offset, &mut reader)?;
        if offset + header.size() > limit {
            return Err(CoreError::corrupt_record(
                offset,
                "record extends past the end of the log",
            ));
        }
        Ok((header, reader))
    }

    /// Reads the payload of the active record for `key` at `offset`.
    pub fn read_payload(&self, offset: u64, key: EntityId) -> CoreResult<(RecordHeader, Vec<u8>)> {
        let (header, mut reader) = self.read(offset)?;
        if header.is_free() {
            return Err(CoreError::corrupt_record(offset, "record is marked free"));
        }
        if header.key() != Some(key) {
            return Err(CoreError::corrupt_record(
                offset,
                format!("record belongs to {:?}, expected {key}", header.key()),
            ));
        }
        let len = usize::try_from(header.payload_length())
            .map_err(|_| CoreError::corrupt_record(offset, "payload too large"))?;
        let payload = reader.read_vec(len)?;
        Ok((header, payload))
    }

    /// Marks the record at `offset` free and returns its length.
    ///
    /// The record's length is re-read, so callers need not track it.
    pub fn mark_free(&self, offset: u64) -> CoreResult<u64> {
        self.ensure_flushed(offset)?;
        let prefix = self.backend.read_at(offset, 5)?;
        let marker = prefix[0];
        let total = i32::from_le_bytes([prefix[1], prefix[2], prefix[3], prefix[4]]);
        if marker != MARKER_IN_USE && marker != MARKER_FREE {
            return Err(CoreError::corrupt_record(
                offset,
                format!("unknown marker 0x{marker:02x}"),
            ));
        }
        if total < PREFIX_LEN as i32 {
            return Err(CoreError::corrupt_record(
                offset,
                format!("total length {total} shorter than prefix"),
            ));
        }

        self.backend.write_at(offset, &[MARKER_FREE])?;
        if self.sync_on_write {
            self.sync()?;
        }
        Ok(total as u64)
    }

    /// Scans every record from the first offset to the end of the log.
    ///
    /// The visitor must consume or skip exactly the payload of each record.
    /// Corrupt records that can still be stepped over are counted and
    /// skipped; an incomplete record at the end of the log stops the scan.
    /// A record is only taken as incomplete when no chain of well-formed
    /// records starts after it and ends exactly at the end of the log.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CorruptRecord`] if a record's length cannot be
    /// stepped over, and [`CoreError::InvalidOperation`] if the visitor
    /// leaves payload bytes unconsumed.
    pub fn read_all<F>(&self, mut visit: F) -> CoreResult<ScanSummary>
    where
        F: FnMut(&RecordHeader, &mut PayloadReader<'_>) -> CoreResult<()>,
    {
        let limit = self.len();
        self.ensure_flushed(limit)?;
        let mut reader = ReadBuffer::new(
            Arc::clone(&self.backend),
            &self.pool,
            STORE_HEADER_LEN,
            limit,
            SCAN_CAPACITY,
        );
        let mut summary = ScanSummary::default();

        while !reader.is_at_end() {
            let offset = reader.position();
            if reader.remaining() < PREFIX_LEN as u64 {
                warn!(offset, remaining = reader.remaining(), "incomplete record prefix at end of log");
                summary.torn_tail = Some(offset);
                break;
            }

            let prefix = RecordPrefix::read_from(&mut reader)?;
            if prefix.total_length < PREFIX_LEN as i32 {
                return Err(CoreError::corrupt_record(
                    offset,
                    format!("total length {} cannot be stepped over", prefix.total_length),
                ));
            }
            let total = prefix.total_length as u64;
            if total > limit - offset {
                // Only the last append can be torn; a record that overruns
                // the log while intact records follow is damage.
                if let Some(next) = self.records_follow(offset + 1, limit)? {
                    return Err(CoreError::corrupt_record(
                        offset,
                        format!("total length {total} overruns the log, yet a record follows at {next}"),
                    ));
                }
                warn!(offset, total, "record extends past the end of log");
                summary.torn_tail = Some(offset);
                break;
            }

            match prefix.finish(offset, &mut reader) {
                Ok(header) => {
                    let mut payload = PayloadReader {
                        reader: &mut reader,
                        remaining: header.payload_length(),
                    };
                    visit(&header, &mut payload)?;
                    if payload.remaining != 0 {
                        return Err(CoreError::invalid_operation(format!(
                            "visitor left {} payload bytes of record {offset}",
                            payload.remaining
                        )));
                    }
                    summary.records += 1;
                    if header.is_free() {
                        summary.free += 1;
                    }
                }
                Err(CoreError::CorruptRecord { offset, message }) => {
                    warn!(offset, %message, "skipping corrupt record");
                    summary.corrupt += 1;
                    let consumed = reader.position() - offset;
                    reader.advance(total - consumed)?;
                }
                Err(e) => return Err(e),
            }
        }

        summary.end = summary.torn_tail.unwrap_or_else(|| reader.position());
        Ok(summary)
    }

    /// Returns the first offset in `start..limit` from which well-formed
    /// record prefixes chain exactly to `limit`.
    fn records_follow(&self, start: u64, limit: u64) -> CoreResult<Option<u64>> {
        let mut window_start = start;
        while window_start + PREFIX_LEN as u64 <= limit {
            let len = (limit - window_start).min(SCAN_CAPACITY as u64) as usize;
            let window = self.backend.read_at(window_start, len)?;
            for (i, bytes) in window.windows(PREFIX_LEN).enumerate() {
                let Ok(bytes) = <&[u8; PREFIX_LEN]>::try_from(bytes) else {
                    continue;
                };
                let at = window_start + i as u64;
                if self.chains_to_end(at, RecordPrefix::decode(bytes), limit)? {
                    return Ok(Some(at));
                }
            }
            window_start += (len - PREFIX_LEN + 1) as u64;
        }
        Ok(None)
    }

    fn chains_to_end(&self, mut at: u64, mut prefix: RecordPrefix, limit: u64) -> CoreResult<bool> {
        loop {
            let Some(next) = prefix.framed_len().and_then(|len| at.checked_add(len)) else {
                return Ok(false);
            };
            if next == limit {
                return Ok(true);
            }
            if next.saturating_add(PREFIX_LEN as u64) > limit {
                return Ok(false);
            }
            let bytes = self.backend.read_at(next, PREFIX_LEN)?;
            let Ok(bytes) = <&[u8; PREFIX_LEN]>::try_from(bytes.as_slice()) else {
                return Ok(false);
            };
            prefix = RecordPrefix::decode(bytes);
            at = next;
        }
    }

    /// Copies `len` bytes from `from` to `to`, front to back.
    ///
    /// The ranges may only overlap when `to` lies below `from`.
    fn copy_range(&self, from: u64, to: u64, len: u64) -> CoreResult<()> {
        if to > from && to < from + len {
            return Err(CoreError::invalid_operation(format!(
                "cannot copy {len} bytes forward over themselves ({from} -> {to})"
            )));
        }
        if len == 0 {
            return Ok(());
        }

        let chunk_len = usize::try_from(len).map_or(WRITE_CAPACITY, |l| l.min(WRITE_CAPACITY));
        let mut reader = ReadBuffer::new(
            Arc::clone(&self.backend),
            &self.pool,
            from,
            from + len,
            chunk_len,
        );
        let mut writer = WriteBuffer::new(Arc::clone(&self.backend), &self.pool, to, chunk_len);
        let mut chunk = self.pool.acquire(chunk_len);

        // Destination bytes always trail the read cursor, so forward copy is safe.
        let mut remaining = len;
        while remaining > 0 {
            let n = usize::try_from(remaining).map_or(chunk_len, |r| r.min(chunk_len));
            reader.copy_into(&mut chunk[..n])?;
            writer.write(&chunk[..n])?;
            remaining -= n as u64;
        }
        writer.finish()?;
        Ok(())
    }

    /// Moves the `size`-byte record at `from` down to `to`.
    ///
    /// Everything in `to..from` must be free, and the gap must be at least
    /// `size + PREFIX_LEN` bytes so the trailing filler's prefix never
    /// touches the original record. Afterwards the record sits at `to`,
    /// followed by a filler covering the rest of `to..from + size`.
    pub(crate) fn move_record(&self, from: u64, to: u64, size: u64) -> CoreResult<()> {
        self.ensure_flushed(from)?;
        for step in MoveStep::ALL {
            self.move_step(step, from, to, size)?;
        }
        Ok(())
    }

    /// Performs one step of [`move_record`](Self::move_record).
    ///
    /// Until [`MoveStep::Prefix`] is written the log still scans to the
    /// original record; afterwards it scans to the copy.
    pub(crate) fn move_step(&self, step: MoveStep, from: u64, to: u64, size: u64) -> CoreResult<()> {
        let gap = from.checked_sub(to).unwrap_or(0);
        if size < PREFIX_LEN as u64 || gap < size + PREFIX_LEN as u64 {
            return Err(CoreError::invalid_operation(format!(
                "cannot move a {size}-byte record across a {gap}-byte gap ({from} -> {to})"
            )));
        }
        let prefix_len = PREFIX_LEN as u64;
        match step {
            MoveStep::CoverGap => self.write_filler(to, gap),
            MoveStep::TrailingFiller => self.write_filler(to + size, gap),
            MoveStep::Body => self.copy_range(from + prefix_len, to + prefix_len, size - prefix_len),
            MoveStep::Prefix => {
                if self.sync_on_write {
                    self.sync()?;
                }
                let prefix = self.backend.read_at(from, PREFIX_LEN)?;
                self.backend.write_at(to, &prefix)?;
                if self.sync_on_write {
                    self.sync()?;
                }
                Ok(())
            }
        }
    }

    /// Appends a copy of the `size`-byte record at `from` to the end of the
    /// log and returns its location.
    ///
    /// Both copies are active until the caller frees the original; a
    /// rebuild in between keeps the later one. Must be called with the
    /// append lock held.
    pub(crate) fn relocate_to_end(&self, from: u64, size: u64) -> CoreResult<RecordLocation> {
        let record_size = u32::try_from(size)
            .map_err(|_| CoreError::invalid_operation("record length overflow"))?;
        self.ensure_flushed(from)?;
        let offset = self.len();
        self.copy_range(from, offset, size)?;
        let end = offset + size;
        self.end.store(end, Ordering::Release);
        self.written.fetch_max(end, Ordering::AcqRel);
        if self.sync_on_write {
            self.sync()?;
        }
        Ok(RecordLocation {
            offset,
            size: record_size,
        })
    }

    /// Writes a free filler record of `len` bytes at `offset`.
    ///
    /// Only the prefix is written; the filler's payload is left as is.
    pub(crate) fn write_filler(&self, offset: u64, len: u64) -> CoreResult<()> {
        let total_length = i32::try_from(len)
            .ok()
            .filter(|l| *l >= PREFIX_LEN as i32)
            .ok_or_else(|| {
                CoreError::corrupt_record(offset, format!("gap of {len} bytes cannot hold a filler"))
            })?;
        let mut writer =
            WriteBuffer::new(Arc::clone(&self.backend), &self.pool, offset, PREFIX_LEN);
        RecordPrefix {
            marker: MARKER_FREE,
            total_length,
            metadata_version: METADATA_FILLER,
            metadata_length: 0,
        }
        .write_to(&mut writer)?;
        writer.finish()?;
        Ok(())
    }

    /// Cuts the log to `len` bytes.
    pub fn truncate(&self, len: u64) -> CoreResult<()> {
        let len = len.max(STORE_HEADER_LEN);
        self.backend.flush()?;
        self.backend.truncate(len)?;
        self.end.store(len, Ordering::Release);
        self.written.fetch_min(len, Ordering::AcqRel);
        let mut flushed = self.flushed.lock();
        *flushed = (*flushed).min(len);
        Ok(())
    }

    /// Flushes buffered writes to the backend.
    pub fn flush(&self) -> CoreResult<()> {
        let mut flushed = self.flushed.lock();
        self.backend.flush()?;
        *flushed = self.written.load(Ordering::Acquire);
        Ok(())
    }

    /// Flushes and syncs the log to durable storage.
    pub fn sync(&self) -> CoreResult<()> {
        self.flush()?;
        self.backend.sync()?;
        Ok(())
    }
}

impl std::fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("serializer", &self.header.serializer)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::header::METADATA_V1;
    use entistore_storage::{FileBackend, InMemoryBackend};
    use tempfile::tempdir;

    fn memory_store() -> (Arc<InMemoryBackend>, EntityStore) {
        let backend = Arc::new(InMemoryBackend::new());
        let store = EntityStore::open(
            backend.clone(),
            BufferPool::shared().clone(),
            Serializer::Cbor,
            false,
        )
        .unwrap();
        (backend, store)
    }

    fn key(n: u8) -> EntityId {
        EntityId::from_bytes([n; 16])
    }

    #[test]
    fn new_store_gets_header() {
        let (backend, store) = memory_store();
        assert_eq!(store.len(), STORE_HEADER_LEN);
        assert!(store.is_empty());
        let data = backend.data();
        assert_eq!(&data[..4], &1u32.to_le_bytes());
        assert_eq!(&data[4..14], b"cbor      ");
    }

    #[test]
    fn existing_header_wins_over_requested_serializer() {
        let backend = Arc::new(InMemoryBackend::new());
        EntityStore::open(backend.clone(), BufferPool::shared().clone(), Serializer::Json, false)
            .unwrap();
        let store =
            EntityStore::open(backend, BufferPool::shared().clone(), Serializer::Cbor, false)
                .unwrap();
        assert_eq!(store.serializer(), Serializer::Json);
    }

    #[test]
    fn truncated_header_fails_open() {
        let backend = Arc::new(InMemoryBackend::with_data(vec![1, 0, 0, 0, b'c']));
        let err = EntityStore::open(backend, BufferPool::shared().clone(), Serializer::Cbor, false)
            .unwrap_err();
        assert!(matches!(err, CoreError::InitializationFailed { .. }));
    }

    #[test]
    fn append_then_read() {
        let (_, store) = memory_store();
        let loc = store
            .append(&RecordMetadata::new(key(1), 1), b"hello")
            .unwrap();
        assert_eq!(loc.offset, STORE_HEADER_LEN);
        assert_eq!(loc.size, 8 + 20 + 5);
        assert_eq!(store.len(), STORE_HEADER_LEN + 33);

        let (header, payload) = store.read_payload(loc.offset, key(1)).unwrap();
        assert_eq!(header.metadata_version, METADATA_V1);
        assert_eq!(header.metadata.unwrap().version, 1);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn read_payload_checks_key_and_marker() {
        let (_, store) = memory_store();
        let loc = store.append(&RecordMetadata::new(key(1), 1), b"x").unwrap();
        assert!(matches!(
            store.read_payload(loc.offset, key(2)),
            Err(CoreError::CorruptRecord { .. })
        ));

        assert_eq!(store.mark_free(loc.offset).unwrap(), u64::from(loc.size));
        assert!(matches!(
            store.read_payload(loc.offset, key(1)),
            Err(CoreError::CorruptRecord { .. })
        ));
        let (header, _) = store.read(loc.offset).unwrap();
        assert!(header.is_free());
    }

    #[test]
    fn read_all_visits_records_in_order() {
        let (_, store) = memory_store();
        for n in 1..=3u8 {
            store
                .append(&RecordMetadata::new(key(n), 1), &vec![n; n as usize * 10])
                .unwrap();
        }
        let second = STORE_HEADER_LEN + 8 + 20 + 10;
        store.mark_free(second).unwrap();

        let mut seen = Vec::new();
        let summary = store
            .read_all(|header, payload| {
                let bytes = payload.read_to_vec()?;
                seen.push((header.key().unwrap(), header.is_free(), bytes.len()));
                Ok(())
            })
            .unwrap();

        assert_eq!(
            seen,
            vec![(key(1), false, 10), (key(2), true, 20), (key(3), false, 30)]
        );
        assert_eq!(summary.records, 3);
        assert_eq!(summary.free, 1);
        assert_eq!(summary.corrupt, 0);
        assert_eq!(summary.end, store.len());
    }

    #[test]
    fn read_all_requires_payload_consumption() {
        let (_, store) = memory_store();
        store.append(&RecordMetadata::new(key(1), 1), b"abc").unwrap();
        let err = store.read_all(|_, _| Ok(())).unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }));
    }

    #[test]
    fn partial_reads_then_skip() {
        let (_, store) = memory_store();
        store.append(&RecordMetadata::new(key(1), 1), b"abcdef").unwrap();
        store
            .read_all(|_, payload| {
                let mut head = [0u8; 2];
                payload.read_exact(&mut head)?;
                assert_eq!(&head, b"ab");
                assert_eq!(payload.remaining(), 4);
                payload.skip()
            })
            .unwrap();
    }

    #[test]
    fn short_total_length_is_corrupt_but_skippable() {
        let mut data = StoreHeader::new(Serializer::Cbor).encode().to_vec();
        // Claims 20 bytes total with a 20-byte v1 metadata block.
        data.push(MARKER_IN_USE);
        data.extend_from_slice(&20i32.to_le_bytes());
        data.push(METADATA_V1);
        data.extend_from_slice(&20u16.to_le_bytes());
        data.extend_from_slice(&[0xAB; 12]);
        let backend = Arc::new(InMemoryBackend::with_data(data));
        let store =
            EntityStore::open(backend, BufferPool::shared().clone(), Serializer::Cbor, false)
                .unwrap();
        let good = store.append(&RecordMetadata::new(key(9), 1), b"ok").unwrap();

        assert!(matches!(
            store.read(STORE_HEADER_LEN),
            Err(CoreError::CorruptRecord { .. })
        ));

        let mut keys = Vec::new();
        let summary = store
            .read_all(|header, payload| {
                keys.push((header.offset, header.key()));
                payload.skip()
            })
            .unwrap();
        assert_eq!(keys, vec![(good.offset, Some(key(9)))]);
        assert_eq!(summary.corrupt, 1);
    }

    #[test]
    fn unsteppable_length_fails_scan() {
        let mut data = StoreHeader::new(Serializer::Cbor).encode().to_vec();
        data.push(MARKER_IN_USE);
        data.extend_from_slice(&3i32.to_le_bytes());
        data.extend_from_slice(&[0, 0, 0]);
        let backend = Arc::new(InMemoryBackend::with_data(data));
        let store =
            EntityStore::open(backend, BufferPool::shared().clone(), Serializer::Cbor, false)
                .unwrap();
        let err = store.read_all(|_, p| p.skip()).unwrap_err();
        assert!(matches!(err, CoreError::CorruptRecord { offset: 14, .. }));
    }

    #[test]
    fn torn_tail_stops_scan() {
        let (backend, store) = memory_store();
        store.append(&RecordMetadata::new(key(1), 1), b"complete").unwrap();
        let torn_at = store.len();
        backend.append(&[MARKER_IN_USE, 200, 0]).unwrap();
        let store =
            EntityStore::open(backend, BufferPool::shared().clone(), Serializer::Cbor, false)
                .unwrap();

        let summary = store.read_all(|_, p| p.skip()).unwrap();
        assert_eq!(summary.records, 1);
        assert_eq!(summary.torn_tail, Some(torn_at));
        assert_eq!(summary.end, torn_at);

        store.truncate(summary.end).unwrap();
        assert_eq!(store.len(), torn_at);
        assert_eq!(store.read_all(|_, p| p.skip()).unwrap().torn_tail, None);
    }

    fn live_records(store: &EntityStore) -> Vec<(u64, EntityId, Vec<u8>)> {
        let mut live = Vec::new();
        store
            .read_all(|header, payload| match header.key() {
                Some(key) if !header.is_free() => {
                    live.push((header.offset, key, payload.read_to_vec()?));
                    Ok(())
                }
                _ => payload.skip(),
            })
            .unwrap();
        live
    }

    #[test]
    fn move_record_leaves_copy_and_trailing_filler() {
        let (_, store) = memory_store();
        let a = store.append(&RecordMetadata::new(key(1), 1), &[1; 60]).unwrap();
        let b = store.append(&RecordMetadata::new(key(2), 1), &[2; 10]).unwrap();
        store.mark_free(a.offset).unwrap();

        store
            .move_record(b.offset, a.offset, u64::from(b.size))
            .unwrap();
        assert_eq!(live_records(&store), vec![(a.offset, key(2), vec![2; 10])]);
        let summary = store.read_all(|_, p| p.skip()).unwrap();
        assert_eq!(summary.free, 1);
        assert_eq!(summary.torn_tail, None);

        store.truncate(a.offset + u64::from(b.size)).unwrap();
        let (_, payload) = store.read_payload(a.offset, key(2)).unwrap();
        assert_eq!(payload, vec![2; 10]);
    }

    #[test]
    fn move_record_needs_room_for_the_trailing_filler() {
        let (_, store) = memory_store();
        let a = store.append(&RecordMetadata::new(key(1), 1), &[1; 10]).unwrap();
        let b = store.append(&RecordMetadata::new(key(2), 1), &[2; 10]).unwrap();
        store.mark_free(a.offset).unwrap();

        let err = store
            .move_record(b.offset, a.offset, u64::from(b.size))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }));
        assert_eq!(live_records(&store), vec![(b.offset, key(2), vec![2; 10])]);
    }

    #[test]
    fn interrupted_move_keeps_every_record() {
        for done in 0..=MoveStep::ALL.len() {
            let backend = Arc::new(InMemoryBackend::new());
            let store = EntityStore::open(
                backend.clone(),
                BufferPool::shared().clone(),
                Serializer::Cbor,
                false,
            )
            .unwrap();
            let a = store.append(&RecordMetadata::new(key(1), 1), &[1; 80]).unwrap();
            let b = store.append(&RecordMetadata::new(key(2), 1), &[2; 30]).unwrap();
            let c = store.append(&RecordMetadata::new(key(3), 1), &[3; 20]).unwrap();
            store.mark_free(a.offset).unwrap();

            for step in &MoveStep::ALL[..done] {
                store
                    .move_step(*step, b.offset, a.offset, u64::from(b.size))
                    .unwrap();
            }
            drop(store);

            let reopened =
                EntityStore::open(backend, BufferPool::shared().clone(), Serializer::Cbor, false)
                    .unwrap();
            let live = live_records(&reopened);
            let moved = if done == MoveStep::ALL.len() {
                a.offset
            } else {
                b.offset
            };
            assert_eq!(
                live,
                vec![(moved, key(2), vec![2; 30]), (c.offset, key(3), vec![3; 20])],
                "after {done} steps"
            );
            let summary = reopened.read_all(|_, p| p.skip()).unwrap();
            assert_eq!(summary.torn_tail, None, "after {done} steps");
            assert_eq!(summary.corrupt, 0, "after {done} steps");
        }
    }

    #[test]
    fn relocated_copy_wins_until_original_is_freed() {
        let (_, store) = memory_store();
        let a = store.append(&RecordMetadata::new(key(1), 1), b"shared").unwrap();
        let copy = store.relocate_to_end(a.offset, u64::from(a.size)).unwrap();
        assert_eq!(copy.offset, a.offset + u64::from(a.size));
        assert_eq!(store.len(), copy.offset + u64::from(copy.size));

        let live = live_records(&store);
        assert_eq!(live.len(), 2);
        assert_eq!(live[1], (copy.offset, key(1), b"shared".to_vec()));

        store.mark_free(a.offset).unwrap();
        assert_eq!(live_records(&store), vec![(copy.offset, key(1), b"shared".to_vec())]);
    }

    #[test]
    fn overrunning_length_before_intact_records_is_not_a_torn_tail() {
        let (backend, store) = memory_store();
        let a = store.append(&RecordMetadata::new(key(1), 1), &[1; 40]).unwrap();
        store.append(&RecordMetadata::new(key(2), 1), &[2; 40]).unwrap();
        store.append(&RecordMetadata::new(key(3), 1), &[3; 40]).unwrap();
        backend
            .write_at(a.offset + 1, &i32::MAX.to_le_bytes())
            .unwrap();

        let err = store.read_all(|_, p| p.skip()).unwrap_err();
        assert!(matches!(err, CoreError::CorruptRecord { offset, .. } if offset == a.offset));
    }

    #[test]
    fn large_payload_spans_buffers() {
        let (_, store) = memory_store();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let loc = store.append(&RecordMetadata::new(key(5), 1), &payload).unwrap();
        let (_, back) = store.read_payload(loc.offset, key(5)).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn file_store_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("entities.dat");
        let offset = {
            let backend = Arc::new(FileBackend::open(&path).unwrap());
            let store =
                EntityStore::open(backend, BufferPool::shared().clone(), Serializer::Json, true)
                    .unwrap();
            store.append(&RecordMetadata::new(key(3), 7), b"{}").unwrap().offset
        };

        let backend = Arc::new(FileBackend::open(&path).unwrap());
        let store =
            EntityStore::open(backend, BufferPool::shared().clone(), Serializer::Cbor, false)
                .unwrap();
        assert_eq!(store.serializer(), Serializer::Json);
        let (header, payload) = store.read_payload(offset, key(3)).unwrap();
        assert_eq!(header.metadata.unwrap().version, 7);
        assert_eq!(payload, b"{}");
    }
}
