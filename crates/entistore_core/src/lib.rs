//! # EntiStore Core
//!
//! Embedded, file-backed entity store.
//!
//! This crate provides:
//! - An append-only entity log of framed, self-describing records
//! - An in-memory table of contents, rebuilt from the log or restored from
//!   a snapshot saved at close
//! - Keyed read/write locks with timeouts and cancellation
//! - Secondary indexes with equality, range and fuzzy full-text lookup
//! - Log compaction (shrink), verification and a change feed
//!
//! Start with [`Engine`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod config;
mod dir;
mod engine;
mod entity;
mod error;
mod lock;
mod stats;
mod toc;

pub mod index;
pub mod record;

pub use change_feed::{ChangeEvent, ChangeFeed, ChangeType, DEFAULT_CHANGE_HISTORY};
pub use config::Config;
pub use dir::EngineDir;
pub use engine::{Engine, Query, ShrinkReport, VerifyReport};
pub use entity::{EntityId, ENTITY_ID_LEN};
pub use error::{CoreError, CoreResult, ErrorClass};
pub use index::{Capabilities, IndexDefinition, IndexValue, ValueType};
pub use lock::{
    AppendGuard, EntityReadGuard, EntityWriteGuard, ExclusiveGate, LockManager, SharedGate,
};
pub use record::ScanSummary;
pub use stats::{EngineStats, StatsSnapshot};
pub use toc::{RebuildReport, TableOfContents, TocEntry, TocSnapshot, TocSource, TOC_VERSION};

pub use entistore_codec::Serializer;
pub use entistore_storage::{BufferPoolConfig, StorageBackend};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
