//! Engine configuration.

use crate::change_feed::DEFAULT_CHANGE_HISTORY;
use crate::index::IndexDefinition;
use entistore_codec::Serializer;
use entistore_storage::BufferPoolConfig;
use std::time::Duration;

/// Configuration for opening an engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the engine directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Payload serializer for new stores. An existing store keeps the one
    /// named in its header.
    pub serializer: Serializer,

    /// Private buffer pool; `None` shares the process-wide pool.
    pub buffer_pool: Option<BufferPoolConfig>,

    /// Upper bound on every lock wait (`None` = wait until cancelled).
    pub lock_timeout: Option<Duration>,

    /// Whether to save the table of contents on close, so the next open
    /// can skip the log scan.
    pub persist_toc: bool,

    /// Whether to sync the entity log after every write (safer but slower).
    pub sync_on_write: bool,

    /// Number of change events kept for polling.
    pub change_history: usize,

    /// Secondary indexes.
    pub indexes: Vec<IndexDefinition>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            serializer: Serializer::default(),
            buffer_pool: None,
            lock_timeout: Some(Duration::from_secs(30)),
            persist_toc: true,
            sync_on_write: false,
            change_history: DEFAULT_CHANGE_HISTORY,
            indexes: Vec::new(),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the serializer for new stores.
    #[must_use]
    pub const fn serializer(mut self, serializer: Serializer) -> Self {
        self.serializer = serializer;
        self
    }

    /// Gives the engine its own buffer pool.
    #[must_use]
    pub fn buffer_pool(mut self, config: BufferPoolConfig) -> Self {
        self.buffer_pool = Some(config);
        self
    }

    /// Sets the lock wait bound.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets whether to save the table of contents on close.
    #[must_use]
    pub const fn persist_toc(mut self, value: bool) -> Self {
        self.persist_toc = value;
        self
    }

    /// Sets whether to sync after every write.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Sets the change history length.
    #[must_use]
    pub const fn change_history(mut self, events: usize) -> Self {
        self.change_history = events;
        self
    }

    /// Declares a secondary index.
    #[must_use]
    pub fn index(mut self, definition: IndexDefinition) -> Self {
        self.indexes.push(definition);
        self
    }
}
