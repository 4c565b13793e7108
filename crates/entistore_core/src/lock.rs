//! Keyed entity locks, the append lock and the store gate.
//!
//! Per key, the lock moves between `Idle`, `Reading(n)` and `Writing`:
//! readers share, a writer excludes everything else on that key. Keys are
//! tracked in a reference-counted table, so a key with no holder and no
//! waiter takes no space.
//!
//! Every acquisition races a [`CancellationToken`] and the optional timeout.
//! A waiter that gives up leaves no trace in the table. Guards release on
//! drop, whatever path the caller takes out.
//!
//! Lock order is gate, then entity, then append.

use crate::entity::EntityId;
use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{
    OwnedRwLockReadGuard, OwnedRwLockWriteGuard, OwnedSemaphorePermit, RwLock, Semaphore,
};
use tokio_util::sync::CancellationToken;

type KeyTable = Mutex<HashMap<EntityId, KeySlot>>;

struct KeySlot {
    lock: Arc<RwLock<()>>,
    refs: usize,
}

/// A claim on a key's slot; the slot is dropped with the last claim.
struct KeyTicket {
    table: Arc<KeyTable>,
    key: EntityId,
}

impl Drop for KeyTicket {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        if let Some(slot) = table.get_mut(&self.key) {
            slot.refs -= 1;
            if slot.refs == 0 {
                table.remove(&self.key);
            }
        }
    }
}

/// Shared hold on one entity.
#[must_use = "the lock is released when the guard is dropped"]
pub struct EntityReadGuard {
    _guard: OwnedRwLockReadGuard<()>,
    _ticket: KeyTicket,
}

/// Exclusive hold on one entity.
#[must_use = "the lock is released when the guard is dropped"]
pub struct EntityWriteGuard {
    _guard: OwnedRwLockWriteGuard<()>,
    _ticket: KeyTicket,
}

/// Hold on the append lock.
#[must_use = "the lock is released when the guard is dropped"]
pub struct AppendGuard {
    _permit: OwnedSemaphorePermit,
}

/// Shared hold on the store gate, taken by every engine operation.
#[must_use = "the lock is released when the guard is dropped"]
pub struct SharedGate {
    _guard: OwnedRwLockReadGuard<()>,
}

/// Exclusive hold on the store gate, taken by shrink and close.
#[must_use = "the lock is released when the guard is dropped"]
pub struct ExclusiveGate {
    _guard: OwnedRwLockWriteGuard<()>,
}

/// Lock manager for one store.
pub struct LockManager {
    keys: Arc<KeyTable>,
    append: Arc<Semaphore>,
    gate: Arc<RwLock<()>>,
    timeout: Option<Duration>,
}

impl LockManager {
    /// Creates a lock manager; `timeout` bounds every acquisition.
    #[must_use]
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            keys: Arc::new(Mutex::new(HashMap::new())),
            append: Arc::new(Semaphore::new(1)),
            gate: Arc::new(RwLock::new(())),
            timeout,
        }
    }

    /// Acquires a read lock on `key`.
    pub async fn enter_entity_read(
        &self,
        key: EntityId,
        cancel: &CancellationToken,
    ) -> CoreResult<EntityReadGuard> {
        let (lock, ticket) = self.checkout(key);
        let guard = self.wait(lock.read_owned(), cancel).await?;
        Ok(EntityReadGuard {
            _guard: guard,
            _ticket: ticket,
        })
    }

    /// Acquires a write lock on `key`.
    pub async fn enter_entity_write(
        &self,
        key: EntityId,
        cancel: &CancellationToken,
    ) -> CoreResult<EntityWriteGuard> {
        let (lock, ticket) = self.checkout(key);
        let guard = self.wait(lock.write_owned(), cancel).await?;
        Ok(EntityWriteGuard {
            _guard: guard,
            _ticket: ticket,
        })
    }

    /// Acquires the append lock.
    pub async fn enter_append(&self, cancel: &CancellationToken) -> CoreResult<AppendGuard> {
        let permit = self
            .wait(Arc::clone(&self.append).acquire_owned(), cancel)
            .await?
            .map_err(|_| CoreError::Cancelled)?;
        Ok(AppendGuard { _permit: permit })
    }

    /// Acquires the store gate shared.
    pub async fn enter_shared(&self, cancel: &CancellationToken) -> CoreResult<SharedGate> {
        let guard = self.wait(Arc::clone(&self.gate).read_owned(), cancel).await?;
        Ok(SharedGate { _guard: guard })
    }

    /// Acquires the store gate exclusively.
    pub async fn enter_exclusive(&self, cancel: &CancellationToken) -> CoreResult<ExclusiveGate> {
        let guard = self.wait(Arc::clone(&self.gate).write_owned(), cancel).await?;
        Ok(ExclusiveGate { _guard: guard })
    }

    /// Returns the number of keys with a holder or waiter.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.keys.lock().len()
    }

    fn checkout(&self, key: EntityId) -> (Arc<RwLock<()>>, KeyTicket) {
        let mut table = self.keys.lock();
        let slot = table.entry(key).or_insert_with(|| KeySlot {
            lock: Arc::new(RwLock::new(())),
            refs: 0,
        });
        slot.refs += 1;
        let lock = Arc::clone(&slot.lock);
        drop(table);
        (
            lock,
            KeyTicket {
                table: Arc::clone(&self.keys),
                key,
            },
        )
    }

    async fn wait<F, T>(&self, acquire: F, cancel: &CancellationToken) -> CoreResult<T>
    where
        F: Future<Output = T>,
    {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let bounded = async {
            match self.timeout {
                Some(timeout) => tokio::time::timeout(timeout, acquire)
                    .await
                    .map_err(|_| CoreError::LockTimeout { timeout }),
                None => Ok(acquire.await),
            }
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(CoreError::Cancelled),
            result = bounded => result,
        }
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("tracked_keys", &self.tracked_keys())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn key(n: u8) -> EntityId {
        EntityId::from_bytes([n; 16])
    }

    #[tokio::test]
    async fn readers_share_a_key() {
        let locks = LockManager::new(Some(Duration::from_millis(200)));
        let cancel = CancellationToken::new();
        let r1 = locks.enter_entity_read(key(1), &cancel).await.unwrap();
        let r2 = locks.enter_entity_read(key(1), &cancel).await.unwrap();
        assert_eq!(locks.tracked_keys(), 1);
        drop((r1, r2));
        assert_eq!(locks.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn writer_excludes_readers_and_writers() {
        let locks = LockManager::new(Some(Duration::from_millis(50)));
        let cancel = CancellationToken::new();
        let w = locks.enter_entity_write(key(1), &cancel).await.unwrap();

        let err = locks.enter_entity_read(key(1), &cancel).await.err().unwrap();
        assert!(matches!(err, CoreError::LockTimeout { .. }));
        let err = locks.enter_entity_write(key(1), &cancel).await.err().unwrap();
        assert!(matches!(err, CoreError::LockTimeout { .. }));
        // Timed-out waiters left the table; only the holder remains.
        assert_eq!(locks.tracked_keys(), 1);

        drop(w);
        assert_eq!(locks.tracked_keys(), 0);
        let _r = locks.enter_entity_read(key(1), &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = LockManager::new(Some(Duration::from_millis(50)));
        let cancel = CancellationToken::new();
        let _w1 = locks.enter_entity_write(key(1), &cancel).await.unwrap();
        let _w2 = locks.enter_entity_write(key(2), &cancel).await.unwrap();
        assert_eq!(locks.tracked_keys(), 2);
    }

    #[tokio::test]
    async fn cancellation_releases_waiter() {
        let locks = Arc::new(LockManager::new(None));
        let cancel = CancellationToken::new();
        let held = locks.enter_entity_write(key(3), &cancel).await.unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            let cancel = cancel.clone();
            tokio::spawn(async move { locks.enter_entity_write(key(3), &cancel).await.err() })
        };
        sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let err = waiter.await.unwrap().unwrap();
        assert!(matches!(err, CoreError::Cancelled));
        drop(held);
        assert_eq!(locks.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn already_cancelled_fails_fast() {
        let locks = LockManager::new(None);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            locks.enter_append(&cancel).await.err().unwrap(),
            CoreError::Cancelled
        ));
        assert!(matches!(
            locks.enter_entity_read(key(1), &cancel).await.err().unwrap(),
            CoreError::Cancelled
        ));
        assert_eq!(locks.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn append_lock_is_serial() {
        let locks = Arc::new(LockManager::new(None));
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let (locks, inside, peak) = (Arc::clone(&locks), Arc::clone(&inside), Arc::clone(&peak));
            tasks.push(tokio::spawn(async move {
                let _append = locks.enter_append(&CancellationToken::new()).await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exclusive_gate_waits_for_shared_holders() {
        let locks = LockManager::new(Some(Duration::from_millis(50)));
        let cancel = CancellationToken::new();
        let shared = locks.enter_shared(&cancel).await.unwrap();
        assert!(matches!(
            locks.enter_exclusive(&cancel).await.err().unwrap(),
            CoreError::LockTimeout { .. }
        ));
        drop(shared);
        let exclusive = locks.enter_exclusive(&cancel).await.unwrap();
        assert!(matches!(
            locks.enter_shared(&cancel).await.err().unwrap(),
            CoreError::LockTimeout { .. }
        ));
        drop(exclusive);
    }
}
