//! # EntiStore Storage
//!
//! Storage backends and pooled I/O for EntiStore.
//!
//! This crate provides the lowest-level storage abstraction for EntiStore.
//! Storage backends are **opaque byte stores** - they do not interpret
//! the data they store.
//!
//! ## Design Principles
//!
//! - Backends are simple byte stores (positional read/write, append, flush)
//! - No knowledge of EntiStore record framing or index logs
//! - Must be `Send + Sync` for concurrent access
//! - Bytes move through pooled buffers, not per-call allocations
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral storage
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Pooled I/O
//!
//! - [`BufferPool`] - size-bucketed reusable buffers with sliding expiration
//! - [`ReadBuffer`] / [`WriteBuffer`] - cursors over a pooled buffer bound to
//!   a backend position
//!
//! ## Example
//!
//! ```rust
//! use entistore_storage::{StorageBackend, InMemoryBackend};
//!
//! let backend = InMemoryBackend::new();
//! let offset = backend.append(b"hello world").unwrap();
//! let data = backend.read_at(offset, 11).unwrap();
//! assert_eq!(&data, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;
mod pool;
mod stream;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use pool::{BufferPool, BufferPoolConfig, PoolStats, PooledBuffer};
pub use stream::{ReadBuffer, Reservation, WriteBuffer};
