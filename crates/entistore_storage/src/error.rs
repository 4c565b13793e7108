//! Storage-level failures.

use std::io;
use thiserror::Error;

/// Shorthand for results produced by this crate.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failure raised by a backend or a pooled buffer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The operating system rejected a file operation.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A positional access reached past the end of the log.
    #[error("access past end of log: {len} bytes at offset {offset}, log holds {size}")]
    ReadPastEnd {
        /// Start of the access.
        offset: u64,
        /// Bytes requested.
        len: usize,
        /// Log length at the time of the call.
        size: u64,
    },

    /// Truncation was asked to grow the log.
    #[error("cannot truncate log of {size} bytes to {requested}")]
    TruncateBeyondEnd {
        /// Requested length.
        requested: u64,
        /// Log length at the time of the call.
        size: u64,
    },

    /// A read buffer ran dry before the caller had what it needed.
    #[error("stream ended at {position} with {needed} bytes still required")]
    UnexpectedEndOfStream {
        /// Where the buffer stopped.
        position: u64,
        /// Bytes that could not be supplied.
        needed: usize,
    },

    /// Reservations must be completed innermost first.
    #[error("reservation at {position} completed out of order")]
    ReservationOrder {
        /// Position of the offending reservation.
        position: u64,
    },

    /// Bytes on disk or in a buffer do not form what the caller expected.
    #[error("corrupted: {0}")]
    Corrupted(String),
}
