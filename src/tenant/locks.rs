//! Per-key async locks.
//!
//! All mutable coordination state is scoped to a key (a tenant, or a
//! tenant/provider pair). Entries nobody holds or waits on are pruned once
//! the map has doubled since the last sweep, so the maps do not grow with
//! every tenant ever seen and an acquisition stays O(1) amortized.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use super::context::TenantId;

/// Maps below this size are never swept.
const MIN_PRUNE_LEN: usize = 64;

/// Shared slots keyed by `K`, swept of unused entries as the map grows.
#[derive(Debug)]
struct SlotMap<K, V> {
    slots: HashMap<K, Arc<V>>,
    prune_at: usize,
}

impl<K: Eq + Hash, V> SlotMap<K, V> {
    fn new() -> Self {
        Self {
            slots: HashMap::new(),
            prune_at: MIN_PRUNE_LEN,
        }
    }

    fn get_or_insert(&mut self, key: K, make: impl FnOnce() -> V) -> Arc<V> {
        if self.slots.len() >= self.prune_at {
            // Only this map holds an unused slot.
            self.slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            self.prune_at = (self.slots.len() * 2).max(MIN_PRUNE_LEN);
        }
        self.slots
            .entry(key)
            .or_insert_with(|| Arc::new(make()))
            .clone()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.len()
    }
}

/// A map of independent async mutexes, one per key.
#[derive(Debug)]
pub struct KeyedMutex<K> {
    slots: Mutex<SlotMap<K, tokio::sync::Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyedMutex<K> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(SlotMap::new()),
        }
    }

    /// Waits for the lock on `key`. Waiters are served in FIFO order.
    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        self.slot(key).lock_owned().await
    }

    /// Takes the lock on `key` only if nobody holds it.
    pub fn try_lock(&self, key: K) -> Option<OwnedMutexGuard<()>> {
        self.slot(key).try_lock_owned().ok()
    }

    fn slot(&self, key: K) -> Arc<tokio::sync::Mutex<()>> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(key, || tokio::sync::Mutex::new(()))
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedMutex<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Tenant-wide reader/writer gate.
///
/// Ordinary writers (credential refresh, retention enforcement) hold the gate
/// shared; tenant erasure holds it exclusively, so nothing else writes to the
/// tenant while it is being erased.
#[derive(Debug)]
pub struct TenantGate {
    slots: Mutex<SlotMap<TenantId, RwLock<()>>>,
}

impl TenantGate {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(SlotMap::new()),
        }
    }

    pub async fn shared(&self, tenant: TenantId) -> OwnedRwLockReadGuard<()> {
        self.slot(tenant).read_owned().await
    }

    pub async fn exclusive(&self, tenant: TenantId) -> OwnedRwLockWriteGuard<()> {
        self.slot(tenant).write_owned().await
    }

    fn slot(&self, tenant: TenantId) -> Arc<RwLock<()>> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(tenant, || RwLock::new(()))
    }
}

impl Default for TenantGate {
    fn default() -> Self {
        Self::new()
    }
}
