// SPDX-License-Identifier: MIT OR Apache-2.0

//! Entry points for the messaging layer.
//!
//! Managers combine the state machines with a [`KeyStore`](crate::traits::KeyStore). Every
//! session and every group is guarded by its own lock: calls against the same session are
//! serialized, calls against different sessions run in parallel.
//!
//! State is loaded, advanced and saved back inside the critical section. If an operation fails
//! or its future is dropped before the save completed, the persisted state stays untouched.
mod group;
mod pairwise;

use std::collections::HashMap;
use std::hash::Hash;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard};

pub use group::{GroupManager, GroupManagerError};
pub use pairwise::{SessionError, SessionManager};

/// Boxed error of a key store implementation.
pub type StoreError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// In-memory value guarded by a lock which can be forgotten once it is released.
pub(crate) trait Vacant {
    fn is_vacant(&self) -> bool;
}

impl Vacant for () {
    fn is_vacant(&self) -> bool {
        true
    }
}

type LockMap<ID, T> = HashMap<ID, Arc<Mutex<T>>>;

/// Lazily created locks, one per identifier.
///
/// Entries only exist while someone holds or waits for the lock, or while the guarded value is
/// not vacant.
#[derive(Debug)]
pub(crate) struct Locks<ID, T> {
    inner: Arc<StdMutex<LockMap<ID, T>>>,
}

impl<ID, T> Default for Locks<ID, T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(StdMutex::new(HashMap::new())),
        }
    }
}

impl<ID, T> Locks<ID, T>
where
    ID: Clone + Eq + Hash,
    T: Default + Vacant,
{
    /// Acquires the lock for the given identifier, creating it if necessary.
    ///
    /// The map itself is only locked for the lookup, never while waiting for the returned lock.
    pub(crate) async fn lock(&self, id: &ID) -> LockGuard<ID, T> {
        let lock = entries(&self.inner).entry(id.clone()).or_default().clone();
        LockGuard {
            id: id.clone(),
            map: self.inner.clone(),
            guard: lock.lock_owned().await,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        entries(&self.inner).len()
    }
}

fn entries<ID, T>(map: &StdMutex<LockMap<ID, T>>) -> MutexGuard<'_, LockMap<ID, T>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exclusive access to the value of one identifier.
///
/// Releasing it removes the entry from the map if nobody else waits for it and the value is
/// vacant.
pub(crate) struct LockGuard<ID, T>
where
    ID: Eq + Hash,
    T: Vacant,
{
    id: ID,
    map: Arc<StdMutex<LockMap<ID, T>>>,
    guard: OwnedMutexGuard<T>,
}

impl<ID: Eq + Hash, T: Vacant> Deref for LockGuard<ID, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<ID: Eq + Hash, T: Vacant> DerefMut for LockGuard<ID, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<ID: Eq + Hash, T: Vacant> Drop for LockGuard<ID, T> {
    fn drop(&mut self) {
        if !self.guard.is_vacant() {
            return;
        }

        let mut entries = entries(&self.map);
        let ours = OwnedMutexGuard::mutex(&self.guard);
        // The map and this guard own the only references, nobody waits for the lock.
        if let Some(lock) = entries.get(&self.id)
            && Arc::ptr_eq(lock, ours)
            && Arc::strong_count(lock) == 2
        {
            entries.remove(&self.id);
        }
    }
}
