//! The byte-store seam beneath the entity log and index logs.

use crate::error::StorageResult;

/// Positional byte store holding one log.
///
/// A backend knows nothing about headers, records or index entries; the
/// core crate owns every format. Methods take `&self` and implementations
/// lock internally, so one backend is shared by concurrent readers and the
/// single appender.
///
/// Contract:
///
/// - bytes read at an offset are the bytes last written there
/// - `append` returns the offset the data landed at
/// - `write_at` may grow the log but never leaves a gap
pub trait StorageBackend: Send + Sync {
    /// Exactly `len` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// [`StorageError::ReadPastEnd`](crate::StorageError::ReadPastEnd) when
    /// the range is not fully inside the log.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Fills as much of `buf` as the log holds from `offset` on and returns
    /// the count. Zero means end of log.
    fn read_into(&self, offset: u64, buf: &mut [u8]) -> StorageResult<usize>;

    /// Writes `data` at the end of the log.
    fn append(&self, data: &[u8]) -> StorageResult<u64>;

    /// Overwrites bytes at `offset`, growing the log if `data` runs past
    /// its end. `offset` itself must not be past the end.
    fn write_at(&self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Hands buffered writes to the OS.
    fn flush(&self) -> StorageResult<()>;

    /// Current log length in bytes.
    fn size(&self) -> StorageResult<u64>;

    /// Blocks until data and metadata are durable.
    fn sync(&self) -> StorageResult<()>;

    /// Cuts the log down to `new_size` bytes. Shrink calls this after
    /// moving live records to the front.
    fn truncate(&self, new_size: u64) -> StorageResult<()>;
}
