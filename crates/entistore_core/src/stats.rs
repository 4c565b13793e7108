//! Engine statistics.
//!
//! # Usage
//!
//! ```rust,ignore
//! let stats = engine.stats().await?;
//! println!("adds: {} reads: {}", stats.adds, stats.reads);
//! println!("reclaimed by shrink: {} bytes", stats.bytes_reclaimed);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Operation counters.
///
/// All counters are atomic and can be read while operations are in progress.
#[derive(Debug, Default)]
pub struct EngineStats {
    adds: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    reads: AtomicU64,
    index_lookups: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    shrinks: AtomicU64,
    bytes_reclaimed: AtomicU64,
    errors: AtomicU64,
}

impl EngineStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_add(&self, bytes: u64) {
        self.adds.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_update(&self, bytes: u64) {
        self.updates.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self, bytes: u64) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_index_lookup(&self) {
        self.index_lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_shrink(&self, reclaimed: u64) {
        self.shrinks.fetch_add(1, Ordering::Relaxed);
        self.bytes_reclaimed.fetch_add(reclaimed, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of adds.
    pub fn adds(&self) -> u64 {
        self.adds.load(Ordering::Relaxed)
    }

    /// Returns the number of updates.
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    /// Returns the number of deletes that removed an entity.
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Returns the number of entity reads that found a record.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Returns the number of index lookups.
    pub fn index_lookups(&self) -> u64 {
        self.index_lookups.load(Ordering::Relaxed)
    }

    /// Returns the number of errors returned by engine operations.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Returns a point-in-time copy of the counters.
    ///
    /// `entity_count` is left at zero; the engine fills it in.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            adds: self.adds(),
            updates: self.updates(),
            deletes: self.deletes(),
            reads: self.reads(),
            index_lookups: self.index_lookups(),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            shrinks: self.shrinks.load(Ordering::Relaxed),
            bytes_reclaimed: self.bytes_reclaimed.load(Ordering::Relaxed),
            errors: self.errors(),
            entity_count: 0,
        }
    }
}

/// A point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Entities added.
    pub adds: u64,
    /// Entities updated.
    pub updates: u64,
    /// Entities deleted.
    pub deletes: u64,
    /// Entity reads.
    pub reads: u64,
    /// Index lookups.
    pub index_lookups: u64,
    /// Record bytes appended by adds and updates.
    pub bytes_written: u64,
    /// Payload bytes read.
    pub bytes_read: u64,
    /// Completed shrinks.
    pub shrinks: u64,
    /// Bytes released by shrink.
    pub bytes_reclaimed: u64,
    /// Failed operations.
    pub errors: u64,
    /// Active entities.
    pub entity_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn default_stats_are_zero() {
        assert_eq!(EngineStats::new().snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn record_operations() {
        let stats = EngineStats::new();
        stats.record_add(100);
        stats.record_update(50);
        stats.record_read(30);
        stats.record_delete();
        stats.record_shrink(512);
        stats.record_index_lookup();

        let snap = stats.snapshot();
        assert_eq!(snap.adds, 1);
        assert_eq!(snap.updates, 1);
        assert_eq!(snap.bytes_written, 150);
        assert_eq!(snap.bytes_read, 30);
        assert_eq!(snap.deletes, 1);
        assert_eq!(snap.shrinks, 1);
        assert_eq!(snap.bytes_reclaimed, 512);
        assert_eq!(snap.index_lookups, 1);
    }

    #[test]
    fn concurrent_updates() {
        let stats = Arc::new(EngineStats::new());
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let s = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..100 {
                        s.record_read(1);
                        s.record_add(1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.reads(), 1000);
        assert_eq!(stats.adds(), 1000);
    }
}
