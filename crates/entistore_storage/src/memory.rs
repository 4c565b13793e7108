//! Volatile backend kept in a `Vec<u8>`.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::ops::Range;

/// Entity log held entirely in memory.
///
/// Backs in-memory stores and lets tests seed or inspect raw log bytes.
/// `flush` and `sync` are no-ops.
///
/// ```rust
/// use entistore_storage::{InMemoryBackend, StorageBackend};
///
/// let log = InMemoryBackend::new();
/// assert_eq!(log.append(b"abc").unwrap(), 0);
/// assert_eq!(log.append(b"de").unwrap(), 3);
/// assert_eq!(log.data(), b"abcde");
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    bytes: RwLock<Vec<u8>>,
}

impl InMemoryBackend {
    /// Empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Log seeded with `bytes`, e.g. a hand-built damaged store.
    #[must_use]
    pub fn with_data(bytes: Vec<u8>) -> Self {
        Self {
            bytes: RwLock::new(bytes),
        }
    }

    /// Snapshot of the current log contents.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }
}

/// Byte range `[offset, offset + len)` when it lies within `size`.
fn span(offset: u64, len: usize, size: usize) -> Option<Range<usize>> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(len)?;
    (end <= size).then_some(start..end)
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let bytes = self.bytes.read();
        span(offset, len, bytes.len())
            .map(|r| bytes[r].to_vec())
            .ok_or(StorageError::ReadPastEnd {
                offset,
                len,
                size: bytes.len() as u64,
            })
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> StorageResult<usize> {
        let bytes = self.bytes.read();
        let tail = usize::try_from(offset)
            .ok()
            .and_then(|start| bytes.get(start..))
            .unwrap_or_default();
        let n = tail.len().min(buf.len());
        buf[..n].copy_from_slice(&tail[..n]);
        Ok(n)
    }

    fn append(&self, data: &[u8]) -> StorageResult<u64> {
        let mut bytes = self.bytes.write();
        let start = bytes.len() as u64;
        bytes.extend_from_slice(data);
        Ok(start)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let mut bytes = self.bytes.write();
        let size = bytes.len();
        let Some(start) = span(offset, 0, size).map(|r| r.start) else {
            return Err(StorageError::ReadPastEnd {
                offset,
                len: data.len(),
                size: size as u64,
            });
        };
        let overlap = (size - start).min(data.len());
        bytes[start..start + overlap].copy_from_slice(&data[..overlap]);
        bytes.extend_from_slice(&data[overlap..]);
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.bytes.read().len() as u64)
    }

    fn sync(&self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&self, new_size: u64) -> StorageResult<()> {
        let mut bytes = self.bytes.write();
        let size = bytes.len() as u64;
        if new_size > size {
            return Err(StorageError::TruncateBeyondEnd {
                requested: new_size,
                size,
            });
        }
        // new_size <= len, so it fits in usize.
        bytes.truncate(new_size as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let log = InMemoryBackend::new();
        assert_eq!(log.size().unwrap(), 0);
        assert_eq!(log.read_at(0, 0).unwrap(), Vec::<u8>::new());
        assert!(log.read_at(0, 1).is_err());
    }

    #[test]
    fn reads_are_bounded_by_length() {
        let log = InMemoryBackend::with_data(b"header".to_vec());
        assert_eq!(log.read_at(2, 4).unwrap(), b"ader");
        assert!(matches!(
            log.read_at(4, 3),
            Err(StorageError::ReadPastEnd { offset: 4, len: 3, size: 6 })
        ));
        assert!(log.read_at(u64::MAX, 2).is_err());
    }

    #[test]
    fn read_into_returns_what_is_left() {
        let log = InMemoryBackend::with_data(b"header".to_vec());
        let mut buf = [0u8; 4];
        assert_eq!(log.read_into(4, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"er");
        assert_eq!(log.read_into(6, &mut buf).unwrap(), 0);
        assert_eq!(log.read_into(u64::MAX, &mut buf).unwrap(), 0);
    }

    #[test]
    fn write_at_overwrites_then_extends() {
        let log = InMemoryBackend::with_data(b"0123".to_vec());
        log.write_at(1, b"ab").unwrap();
        log.write_at(3, b"xyz").unwrap();
        log.write_at(6, b"!").unwrap();
        assert_eq!(log.data(), b"0abxyz!");
        assert!(log.write_at(8, b"?").is_err());
    }

    #[test]
    fn truncate_drops_the_tail() {
        let log = InMemoryBackend::with_data(b"keep-drop".to_vec());
        log.truncate(4).unwrap();
        assert_eq!(log.data(), b"keep");
        assert!(matches!(
            log.truncate(5),
            Err(StorageError::TruncateBeyondEnd { requested: 5, size: 4 })
        ));
    }
}
