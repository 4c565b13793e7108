//! Secondary indexes.
//!
//! Indexes are declared in [`Config`](crate::Config) and maintained by the
//! engine on every write. Each index keeps:
//!
//! - a sorted list of `(value, entity)` entries for equality and range
//!   lookup ([`Capabilities::SORTED`])
//! - optionally, a catalog of texts feeding a BK-tree of tokens for fuzzy
//!   full-text search ([`Capabilities::FULL_TEXT`])
//! - its own mutation log, replayed at open
//!
//! Indexes are derived data: the entity log stays authoritative, and a
//! missing or mismatched index log is rebuilt from it.

mod engine;
mod fuzzy;
mod log;
mod secondary;
mod value;

pub use engine::{IndexEngine, IndexOpenReport, INDEX_LOG_EXTENSION};
pub use fuzzy::{edit_distance, tokenize, BkTree};
pub use log::{IndexLog, IndexMetadata, IndexMutation, INDEX_LOG_VERSION};
pub use secondary::{Index, IndexEntry};
pub use value::{Capabilities, IndexDefinition, IndexValue, ValueType};
