//! Size-bucketed buffer pool.
//!
//! All record and log I/O moves through buffers lent by a [`BufferPool`], so
//! steady-state reads and writes do not allocate.
//!
//! ## Levels
//!
//! ```text
//! level 0: min_size
//! level 1: min_size * 2
//! level 2: min_size * 4
//! ...
//! level n-1: min_size << (n-1)
//! ```
//!
//! `acquire` tries the exact level first, then walks upward reusing a larger
//! idle buffer, and only then allocates. Requests larger than the top level
//! are allocated exactly and dropped on release.
//!
//! ## Expiration
//!
//! With a sliding expiration configured, released buffers that stay idle for
//! longer than the window are evicted by a single background sweeper. The
//! sweeper sleeps until the next-soonest expiry and re-arms itself after each
//! sweep; it never polls.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

/// Configuration for a [`BufferPool`].
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Size of the smallest level in bytes.
    pub min_size: usize,
    /// Number of levels; level `i` holds buffers of `min_size << i` bytes.
    pub level_count: usize,
    /// Idle time after which a pooled buffer is evicted (`None` = never).
    pub sliding_expiration: Option<Duration>,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            min_size: 4 * 1024,
            level_count: 12, // up to 8 MB
            sliding_expiration: Some(Duration::from_secs(60)),
        }
    }
}

impl BufferPoolConfig {
    /// Sets the smallest level size.
    #[must_use]
    pub const fn min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    /// Sets the number of levels.
    #[must_use]
    pub const fn level_count(mut self, count: usize) -> Self {
        self.level_count = count;
        self
    }

    /// Sets (or disables) the sliding expiration window.
    #[must_use]
    pub const fn sliding_expiration(mut self, window: Option<Duration>) -> Self {
        self.sliding_expiration = window;
        self
    }
}

/// Point-in-time counters for a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers created with fresh memory.
    pub allocations: u64,
    /// Acquisitions served from a free list.
    pub reuses: u64,
    /// Buffers evicted by the sweeper.
    pub evictions: u64,
    /// Released buffers that did not fit a level and were dropped.
    pub discarded: u64,
    /// Buffers currently idle in the pool.
    pub idle: usize,
}

struct IdleBuffer {
    buf: Vec<u8>,
    released_at: Instant,
}

/// A free list of same-sized buffers.
struct BufferLevel {
    size: usize,
    free: Mutex<Vec<IdleBuffer>>,
}

#[derive(Default)]
struct SweepState {
    deadline: Option<Instant>,
    spawned: bool,
    shutdown: bool,
}

#[derive(Default)]
struct SweepSignal {
    state: Mutex<SweepState>,
    wake: Condvar,
}

struct PoolInner {
    min_size: usize,
    expiration: Option<Duration>,
    levels: Vec<BufferLevel>,
    allocations: AtomicU64,
    reuses: AtomicU64,
    evictions: AtomicU64,
    discarded: AtomicU64,
    sweep: Arc<SweepSignal>,
}

/// A shared pool of reusable byte buffers.
///
/// Cloning a `BufferPool` is cheap; clones share the same free lists.
///
/// # Example
///
/// ```rust
/// use entistore_storage::{BufferPool, BufferPoolConfig};
///
/// let pool = BufferPool::new(BufferPoolConfig::default());
/// {
///     let buf = pool.acquire(1000);
///     assert!(buf.len() >= 1000);
/// } // returned to the pool here
/// let _again = pool.acquire(1000);
/// assert_eq!(pool.stats().reuses, 1);
/// ```
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Creates a new pool.
    pub fn new(config: BufferPoolConfig) -> Self {
        let min_size = config.min_size.max(1);
        let level_count = config.level_count.max(1);
        let levels = (0..level_count)
            .map(|i| BufferLevel {
                size: min_size << i,
                free: Mutex::new(Vec::new()),
            })
            .collect();

        Self {
            inner: Arc::new(PoolInner {
                min_size,
                expiration: config.sliding_expiration,
                levels,
                allocations: AtomicU64::new(0),
                reuses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
                sweep: Arc::new(SweepSignal::default()),
            }),
        }
    }

    /// Returns the process-wide default pool.
    pub fn shared() -> &'static BufferPool {
        static SHARED: OnceLock<BufferPool> = OnceLock::new();
        SHARED.get_or_init(|| BufferPool::new(BufferPoolConfig::default()))
    }

    /// Lends a buffer of at least `min_size` bytes.
    ///
    /// Never fails: when no idle buffer fits, fresh memory is allocated.
    #[must_use]
    pub fn acquire(&self, min_size: usize) -> PooledBuffer {
        let inner = &self.inner;
        let Some(start) = inner.level_for_request(min_size) else {
            inner.allocations.fetch_add(1, Ordering::Relaxed);
            return PooledBuffer::new(vec![0u8; min_size], Arc::clone(inner));
        };

        for level in &inner.levels[start..] {
            if let Some(idle) = level.free.lock().pop() {
                inner.reuses.fetch_add(1, Ordering::Relaxed);
                return PooledBuffer::new(idle.buf, Arc::clone(inner));
            }
        }

        inner.allocations.fetch_add(1, Ordering::Relaxed);
        let size = inner.levels[start].size;
        PooledBuffer::new(vec![0u8; size], Arc::clone(inner))
    }

    /// Returns the current counters.
    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        PoolStats {
            allocations: inner.allocations.load(Ordering::Relaxed),
            reuses: inner.reuses.load(Ordering::Relaxed),
            evictions: inner.evictions.load(Ordering::Relaxed),
            discarded: inner.discarded.load(Ordering::Relaxed),
            idle: inner.levels.iter().map(|l| l.free.lock().len()).sum(),
        }
    }

    /// Returns the size of the smallest level.
    #[must_use]
    pub fn min_size(&self) -> usize {
        self.inner.min_size
    }

    /// Evicts every buffer idle for longer than the expiration window.
    ///
    /// The background sweeper calls this on its own; it is public so callers
    /// can reclaim memory eagerly.
    pub fn evict_expired(&self) -> usize {
        let before = self.inner.evictions.load(Ordering::Relaxed);
        self.inner.evict_expired(Instant::now());
        (self.inner.evictions.load(Ordering::Relaxed) - before) as usize
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("min_size", &self.inner.min_size)
            .field("levels", &self.inner.levels.len())
            .field("expiration", &self.inner.expiration)
            .finish_non_exhaustive()
    }
}

impl PoolInner {
    /// Level index serving a request, or `None` when it exceeds the top level.
    fn level_for_request(&self, size: usize) -> Option<usize> {
        let index = if size <= self.min_size {
            0
        } else {
            size.div_ceil(self.min_size).next_power_of_two().trailing_zeros() as usize
        };
        (index < self.levels.len()).then_some(index)
    }

    /// Level whose size is exactly `len`.
    fn level_for_exact(&self, len: usize) -> Option<usize> {
        if len == 0 || len % self.min_size != 0 {
            return None;
        }
        let ratio = len / self.min_size;
        if !ratio.is_power_of_two() {
            return None;
        }
        let index = ratio.trailing_zeros() as usize;
        (index < self.levels.len()).then_some(index)
    }

    fn release(self: &Arc<Self>, buf: Vec<u8>) {
        let Some(index) = self.level_for_exact(buf.len()) else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let released_at = Instant::now();
        self.levels[index]
            .free
            .lock()
            .push(IdleBuffer { buf, released_at });

        if let Some(window) = self.expiration {
            self.arm_sweeper(released_at + window);
        }
    }

    fn arm_sweeper(self: &Arc<Self>, deadline: Instant) {
        let signal = &self.sweep;
        let mut state = signal.state.lock();
        if state.shutdown {
            return;
        }

        let earlier = state.deadline.map_or(true, |current| deadline < current);
        if !earlier {
            return;
        }
        state.deadline = Some(deadline);

        if state.spawned {
            signal.wake.notify_one();
            return;
        }

        let pool = Arc::downgrade(self);
        let thread_signal = Arc::clone(signal);
        let spawned = std::thread::Builder::new()
            .name("entistore-pool-sweeper".into())
            .spawn(move || sweep_loop(pool, thread_signal));
        match spawned {
            Ok(_) => state.spawned = true,
            Err(e) => tracing::warn!(error = %e, "buffer pool sweeper could not start"),
        }
    }

    /// Drops expired buffers and returns the next-soonest expiry, if any.
    fn evict_expired(&self, now: Instant) -> Option<Instant> {
        let window = self.expiration?;
        let mut next: Option<Instant> = None;

        for level in &self.levels {
            let mut free = level.free.lock();
            let before = free.len();
            free.retain(|idle| idle.released_at + window > now);
            let evicted = before - free.len();
            if evicted > 0 {
                self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            }
            for idle in free.iter() {
                let expiry = idle.released_at + window;
                next = Some(next.map_or(expiry, |n| n.min(expiry)));
            }
        }

        next
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let mut state = self.sweep.state.lock();
        state.shutdown = true;
        self.sweep.wake.notify_all();
    }
}

fn sweep_loop(pool: Weak<PoolInner>, signal: Arc<SweepSignal>) {
    let mut state = signal.state.lock();
    loop {
        if state.shutdown {
            return;
        }

        let Some(deadline) = state.deadline else {
            signal.wake.wait(&mut state);
            continue;
        };

        if Instant::now() < deadline {
            signal.wake.wait_until(&mut state, deadline);
            continue;
        }

        state.deadline = None;
        let next = MutexGuard::unlocked(&mut state, || {
            let pool = pool.upgrade()?;
            let next = pool.evict_expired(Instant::now());
            tracing::trace!(next = ?next, "buffer pool sweep finished");
            next
        });

        if let Some(next) = next {
            state.deadline = Some(state.deadline.map_or(next, |d| d.min(next)));
        } else if pool.strong_count() == 0 {
            return;
        }
    }
}

/// A buffer on loan from a [`BufferPool`].
///
/// The buffer returns to its pool exactly once, when the handle is dropped.
/// Handles are move-only, so double release is impossible.
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Option<Arc<PoolInner>>,
}

impl PooledBuffer {
    fn new(buf: Vec<u8>, pool: Arc<PoolInner>) -> Self {
        Self {
            buf,
            pool: Some(pool),
        }
    }

    /// Returns the buffer capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Returns a pool handle able to lend replacement buffers.
    pub(crate) fn pool(&self) -> Option<BufferPool> {
        self.pool.as_ref().map(|inner| BufferPool {
            inner: Arc::clone(inner),
        })
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(std::mem::take(&mut self.buf));
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("capacity", &self.buf.len())
            .finish()
    }
}
