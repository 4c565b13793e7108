//! Pooled stream buffers over a storage backend.
//!
//! [`ReadBuffer`] and [`WriteBuffer`] are cursors over a buffer borrowed from
//! a [`BufferPool`], bound to a position in a [`StorageBackend`]. They let
//! record and log codecs work byte-by-byte without allocating per call.
//!
//! ## Reservations
//!
//! Length-prefixed framing is written with a reservation:
//!
//! ```rust
//! use entistore_storage::{BufferPool, InMemoryBackend, StorageBackend, WriteBuffer};
//! use std::sync::Arc;
//!
//! let backend: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
//! let mut writer = WriteBuffer::new(Arc::clone(&backend), BufferPool::shared(), 0, 64);
//! let len = writer.reserve(4).unwrap();
//! writer.write(b"framed").unwrap();
//! writer.apply_length(len).unwrap();
//! writer.finish().unwrap();
//!
//! assert_eq!(backend.read_at(0, 4).unwrap(), 6u32.to_le_bytes());
//! ```

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::pool::{BufferPool, PooledBuffer};
use std::sync::Arc;

/// A read cursor with refill-on-demand over a backend.
pub struct ReadBuffer {
    backend: Arc<dyn StorageBackend>,
    buf: PooledBuffer,
    /// Index of the next unread byte in `buf`.
    start: usize,
    /// Number of valid bytes in `buf`.
    end: usize,
    /// Backend offset of `buf[end]`.
    stream_pos: u64,
    /// Logical end of the stream.
    limit: u64,
}

impl ReadBuffer {
    /// Creates a reader starting at `position` and ending at `limit`.
    ///
    /// Nothing is read until the first request.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        pool: &BufferPool,
        position: u64,
        limit: u64,
        capacity: usize,
    ) -> Self {
        Self {
            backend,
            buf: pool.acquire(capacity),
            start: 0,
            end: 0,
            stream_pos: position,
            limit: limit.max(position),
        }
    }

    /// Returns the stream position of the next unread byte.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.stream_pos - (self.end - self.start) as u64
    }

    /// Returns the number of bytes left before the end of the stream.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.limit - self.position()
    }

    /// Returns true when the cursor sits exactly at the end of the stream.
    #[must_use]
    pub fn is_at_end(&self) -> bool {
        self.remaining() == 0
    }

    /// Returns the buffer capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Ensures at least `len` unread bytes are buffered.
    ///
    /// Slides unread bytes to the front and refills from the backend. When
    /// `len` exceeds the buffer capacity, a larger buffer is borrowed from the
    /// pool and the unread tail is copied over.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnexpectedEndOfStream`] if the stream ends
    /// before `len` bytes are available.
    pub fn request_space(&mut self, len: usize) -> StorageResult<()> {
        let buffered = self.end - self.start;
        if buffered >= len {
            return Ok(());
        }

        if (self.remaining() as usize) < len {
            return Err(StorageError::UnexpectedEndOfStream {
                position: self.position(),
                needed: len - self.remaining() as usize,
            });
        }

        if len > self.buf.capacity() {
            self.expand(len);
        } else if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end = buffered;
            self.start = 0;
        }

        while self.end - self.start < len {
            let room = self.buf.capacity() - self.end;
            let wanted = room.min((self.limit - self.stream_pos) as usize);
            let read = self
                .backend
                .read_into(self.stream_pos, &mut self.buf[self.end..self.end + wanted])?;
            if read == 0 {
                return Err(StorageError::UnexpectedEndOfStream {
                    position: self.position(),
                    needed: len - (self.end - self.start),
                });
            }
            self.end += read;
            self.stream_pos += read as u64;
        }

        Ok(())
    }

    fn expand(&mut self, len: usize) {
        let Some(pool) = self.buf.pool() else {
            return;
        };
        let mut larger = pool.acquire(len);
        let buffered = self.end - self.start;
        larger[..buffered].copy_from_slice(&self.buf[self.start..self.end]);
        self.buf = larger;
        self.start = 0;
        self.end = buffered;
    }

    /// Reads one byte.
    pub fn read_byte(&mut self) -> StorageResult<u8> {
        self.request_space(1)?;
        let b = self.buf[self.start];
        self.start += 1;
        Ok(b)
    }

    /// Returns the byte `offset` positions ahead without consuming it.
    pub fn peek_byte(&mut self, offset: usize) -> StorageResult<u8> {
        self.request_space(offset + 1)?;
        Ok(self.buf[self.start + offset])
    }

    /// Fills `dest` from the stream.
    ///
    /// Large copies are served in buffer-sized chunks instead of expanding.
    pub fn copy_into(&mut self, dest: &mut [u8]) -> StorageResult<()> {
        let mut copied = 0;
        while copied < dest.len() {
            if self.start == self.end {
                let chunk = (dest.len() - copied).min(self.buf.capacity());
                self.request_space(chunk)?;
            }
            let n = (self.end - self.start).min(dest.len() - copied);
            dest[copied..copied + n].copy_from_slice(&self.buf[self.start..self.start + n]);
            self.start += n;
            copied += n;
        }
        Ok(())
    }

    /// Skips `len` bytes.
    pub fn advance(&mut self, len: u64) -> StorageResult<()> {
        if len > self.remaining() {
            return Err(StorageError::UnexpectedEndOfStream {
                position: self.position(),
                needed: (len - self.remaining()) as usize,
            });
        }

        let buffered = (self.end - self.start) as u64;
        if len <= buffered {
            self.start += len as usize;
        } else {
            self.stream_pos += len - buffered;
            self.start = 0;
            self.end = 0;
        }
        Ok(())
    }

    /// Reads `len` bytes into a new vector.
    pub fn read_vec(&mut self, len: usize) -> StorageResult<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.copy_into(&mut out)?;
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self) -> StorageResult<[u8; N]> {
        self.request_space(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.start..self.start + N]);
        self.start += N;
        Ok(out)
    }

    /// Reads a little-endian `u16`.
    pub fn read_u16_le(&mut self) -> StorageResult<u16> {
        self.read_array().map(u16::from_le_bytes)
    }

    /// Reads a little-endian `u32`.
    pub fn read_u32_le(&mut self) -> StorageResult<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    /// Reads a little-endian `i32`.
    pub fn read_i32_le(&mut self) -> StorageResult<i32> {
        self.read_array().map(i32::from_le_bytes)
    }

    /// Reads a little-endian `u64`.
    pub fn read_u64_le(&mut self) -> StorageResult<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    /// Reads a little-endian `i64`.
    pub fn read_i64_le(&mut self) -> StorageResult<i64> {
        self.read_array().map(i64::from_le_bytes)
    }

    /// Reads a fixed-size byte array.
    pub fn read_bytes<const N: usize>(&mut self) -> StorageResult<[u8; N]> {
        self.read_array()
    }
}

impl std::fmt::Debug for ReadBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadBuffer")
            .field("position", &self.position())
            .field("limit", &self.limit)
            .field("capacity", &self.buf.capacity())
            .finish()
    }
}

/// A reserved length field awaiting [`WriteBuffer::apply_length`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    position: u64,
    size: usize,
}

impl Reservation {
    /// Stream position of the reserved field.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Width of the reserved field in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }
}

/// A buffered write cursor over a backend.
///
/// Bytes are written to the backend on [`flush`](Self::flush), when the
/// buffer fills up, or when the cursor is dropped.
pub struct WriteBuffer {
    backend: Arc<dyn StorageBackend>,
    buf: PooledBuffer,
    /// Number of buffered bytes.
    len: usize,
    /// Backend offset of `buf[0]`.
    flushed_pos: u64,
    reservations: Vec<Reservation>,
}

impl WriteBuffer {
    /// Creates a writer at `position`.
    ///
    /// `position` must not lie beyond the end of the backend when the first
    /// flush happens.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        pool: &BufferPool,
        position: u64,
        capacity: usize,
    ) -> Self {
        Self {
            backend,
            buf: pool.acquire(capacity),
            len: 0,
            flushed_pos: position,
            reservations: Vec::new(),
        }
    }

    /// Returns the stream position of the next byte to be written.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.flushed_pos + self.len as u64
    }

    /// Writes one byte.
    pub fn write_byte(&mut self, b: u8) -> StorageResult<()> {
        if self.len == self.buf.capacity() {
            self.flush()?;
        }
        self.buf[self.len] = b;
        self.len += 1;
        Ok(())
    }

    /// Writes a byte slice, flushing as the buffer fills.
    pub fn write(&mut self, mut bytes: &[u8]) -> StorageResult<()> {
        while !bytes.is_empty() {
            if self.len == self.buf.capacity() {
                self.flush()?;
            }
            let n = (self.buf.capacity() - self.len).min(bytes.len());
            self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
            self.len += n;
            bytes = &bytes[n..];
        }
        Ok(())
    }

    /// Writes a little-endian `u16`.
    pub fn write_u16_le(&mut self, v: u16) -> StorageResult<()> {
        self.write(&v.to_le_bytes())
    }

    /// Writes a little-endian `u32`.
    pub fn write_u32_le(&mut self, v: u32) -> StorageResult<()> {
        self.write(&v.to_le_bytes())
    }

    /// Writes a little-endian `i32`.
    pub fn write_i32_le(&mut self, v: i32) -> StorageResult<()> {
        self.write(&v.to_le_bytes())
    }

    /// Writes a little-endian `u64`.
    pub fn write_u64_le(&mut self, v: u64) -> StorageResult<()> {
        self.write(&v.to_le_bytes())
    }

    /// Writes a little-endian `i64`.
    pub fn write_i64_le(&mut self, v: i64) -> StorageResult<()> {
        self.write(&v.to_le_bytes())
    }

    /// Reserves a `size`-byte length field (2, 4 or 8 bytes) at the current
    /// position.
    pub fn reserve(&mut self, size: usize) -> StorageResult<Reservation> {
        if !matches!(size, 2 | 4 | 8) {
            return Err(StorageError::Corrupted(format!(
                "unsupported reservation width {size}"
            )));
        }
        let reservation = Reservation {
            position: self.position(),
            size,
        };
        self.write(&[0u8; 8][..size])?;
        self.reservations.push(reservation);
        Ok(reservation)
    }

    /// Back-patches a reservation with the number of bytes written after it.
    ///
    /// Reservations nest: only the innermost outstanding one may be applied.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ReservationOrder`] when `reservation` is not the
    /// innermost outstanding reservation.
    pub fn apply_length(&mut self, reservation: Reservation) -> StorageResult<u64> {
        if self.reservations.last() != Some(&reservation) {
            return Err(StorageError::ReservationOrder {
                position: reservation.position,
            });
        }
        self.reservations.pop();

        let content = self.position() - (reservation.position + reservation.size as u64);
        let encoded = content.to_le_bytes();
        if reservation.size < 8 && content >> (reservation.size * 8) != 0 {
            return Err(StorageError::Corrupted(format!(
                "length {content} does not fit a {}-byte field",
                reservation.size
            )));
        }
        let field = &encoded[..reservation.size];

        // Part of the field may already be on the backend.
        let split = self
            .flushed_pos
            .saturating_sub(reservation.position)
            .min(reservation.size as u64) as usize;
        if split > 0 {
            self.backend
                .write_at(reservation.position, &field[..split])?;
        }
        if split < reservation.size {
            let at = (reservation.position + split as u64 - self.flushed_pos) as usize;
            self.buf[at..at + reservation.size - split].copy_from_slice(&field[split..]);
        }

        Ok(content)
    }

    /// Writes buffered bytes to the backend.
    pub fn flush(&mut self) -> StorageResult<()> {
        if self.len == 0 {
            return Ok(());
        }
        self.backend.write_at(self.flushed_pos, &self.buf[..self.len])?;
        self.flushed_pos += self.len as u64;
        self.len = 0;
        Ok(())
    }

    /// Flushes and returns the final stream position.
    pub fn finish(mut self) -> StorageResult<u64> {
        self.flush()?;
        Ok(self.flushed_pos)
    }
}

impl Drop for WriteBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::error!(
                position = self.flushed_pos,
                pending = self.len,
                error = %e,
                "write buffer flush on drop failed"
            );
        }
    }
}

impl std::fmt::Debug for WriteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBuffer")
            .field("position", &self.position())
            .field("buffered", &self.len)
            .field("reservations", &self.reservations.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;
    use crate::pool::BufferPoolConfig;

    fn small_pool() -> BufferPool {
        BufferPool::new(
            BufferPoolConfig::default()
                .min_size(16)
                .level_count(6)
                .sliding_expiration(None),
        )
    }

    fn backend_with(data: &[u8]) -> Arc<dyn StorageBackend> {
        Arc::new(InMemoryBackend::with_data(data.to_vec()))
    }

    #[test]
    fn read_refills_across_buffer_boundary() {
        let data: Vec<u8> = (0..100u8).collect();
        let backend = backend_with(&data);
        let pool = small_pool();
        let mut reader = ReadBuffer::new(backend, &pool, 0, 100, 16);

        for expected in 0..100u8 {
            assert_eq!(reader.read_byte().unwrap(), expected);
        }
        assert!(reader.is_at_end());
    }

    #[test]
    fn reaching_exact_end_is_not_an_error() {
        let backend = backend_with(b"abcd");
        let pool = small_pool();
        let mut reader = ReadBuffer::new(backend, &pool, 0, 4, 16);

        assert_eq!(reader.read_vec(4).unwrap(), b"abcd");
        assert!(reader.is_at_end());
        assert!(matches!(
            reader.read_byte(),
            Err(StorageError::UnexpectedEndOfStream { needed: 1, .. })
        ));
    }

    #[test]
    fn request_space_expands_through_pool() {
        let data: Vec<u8> = (0..200u8).collect();
        let backend = backend_with(&data);
        let pool = small_pool();
        let mut reader = ReadBuffer::new(backend, &pool, 0, 200, 16);

        reader.advance(3).unwrap();
        reader.request_space(100).unwrap();
        assert!(reader.capacity() >= 100);
        assert_eq!(reader.peek_byte(99).unwrap(), 102);
        assert_eq!(reader.read_byte().unwrap(), 3);
    }

    #[test]
    fn advance_skips_unbuffered_bytes() {
        let data: Vec<u8> = (0..64u8).collect();
        let backend = backend_with(&data);
        let pool = small_pool();
        let mut reader = ReadBuffer::new(backend, &pool, 0, 64, 16);

        reader.read_byte().unwrap();
        reader.advance(40).unwrap();
        assert_eq!(reader.position(), 41);
        assert_eq!(reader.read_byte().unwrap(), 41);
        assert!(reader.advance(100).is_err());
    }

    #[test]
    fn little_endian_helpers() {
        let mut data = Vec::new();
        data.extend_from_slice(&0xBEEFu16.to_le_bytes());
        data.extend_from_slice(&(-7i32).to_le_bytes());
        data.extend_from_slice(&u64::MAX.to_le_bytes());
        let len = data.len() as u64;
        let pool = small_pool();
        let mut reader = ReadBuffer::new(backend_with(&data), &pool, 0, len, 16);

        assert_eq!(reader.read_u16_le().unwrap(), 0xBEEF);
        assert_eq!(reader.read_i32_le().unwrap(), -7);
        assert_eq!(reader.read_u64_le().unwrap(), u64::MAX);
    }

    #[test]
    fn write_flushes_on_drop() {
        let backend: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
        let pool = small_pool();
        {
            let mut writer = WriteBuffer::new(Arc::clone(&backend), &pool, 0, 16);
            writer.write(b"hello").unwrap();
        }
        assert_eq!(backend.read_at(0, 5).unwrap(), b"hello");
    }

    #[test]
    fn write_larger_than_buffer() {
        let backend: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
        let pool = small_pool();
        let payload: Vec<u8> = (0..=255u8).collect();

        let mut writer = WriteBuffer::new(Arc::clone(&backend), &pool, 0, 16);
        writer.write(&payload).unwrap();
        assert_eq!(writer.finish().unwrap(), 256);

        assert_eq!(backend.read_at(0, 256).unwrap(), payload);
    }

    #[test]
    fn nested_reservations_apply_lifo() {
        let backend: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
        let pool = small_pool();
        let mut writer = WriteBuffer::new(Arc::clone(&backend), &pool, 0, 16);

        let outer = writer.reserve(4).unwrap();
        writer.write_byte(9).unwrap();
        let inner = writer.reserve(2).unwrap();
        writer.write(b"abc").unwrap();

        assert!(matches!(
            writer.apply_length(outer),
            Err(StorageError::ReservationOrder { position: 0 })
        ));
        assert_eq!(writer.apply_length(inner).unwrap(), 3);
        assert_eq!(writer.apply_length(outer).unwrap(), 6);
        writer.finish().unwrap();

        let bytes = backend.read_at(0, 10).unwrap();
        assert_eq!(&bytes[0..4], &6u32.to_le_bytes());
        assert_eq!(bytes[4], 9);
        assert_eq!(&bytes[5..7], &3u16.to_le_bytes());
        assert_eq!(&bytes[7..], b"abc");
    }

    #[test]
    fn reservation_patched_after_flush() {
        let backend: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
        let pool = small_pool();
        let mut writer = WriteBuffer::new(Arc::clone(&backend), &pool, 0, 16);

        let len = writer.reserve(4).unwrap();
        writer.write(&[7u8; 40]).unwrap();
        writer.apply_length(len).unwrap();
        writer.finish().unwrap();

        assert_eq!(backend.read_at(0, 4).unwrap(), 40u32.to_le_bytes());
        assert_eq!(backend.size().unwrap(), 44);
    }

    #[test]
    fn reservation_overflow_is_rejected() {
        let backend: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
        let pool = small_pool();
        let mut writer = WriteBuffer::new(backend, &pool, 0, 16);

        let len = writer.reserve(2).unwrap();
        writer.write(&vec![0u8; 70_000]).unwrap();
        assert!(matches!(
            writer.apply_length(len),
            Err(StorageError::Corrupted(_))
        ));
    }

    #[test]
    fn buffers_return_to_pool() {
        let backend = backend_with(b"0123456789");
        let pool = small_pool();
        {
            let mut reader = ReadBuffer::new(Arc::clone(&backend), &pool, 0, 10, 16);
            reader.read_byte().unwrap();
            let _writer = WriteBuffer::new(backend, &pool, 10, 16);
        }
        assert_eq!(pool.stats().idle, 2);
    }
}
