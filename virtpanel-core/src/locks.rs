//! Per-entity mutual exclusion.
//!
//! Operations on the same VM, pool, network or ISO image are serialised through one
//! async mutex per entity. Operations spanning several entities take their
//! locks in [`EntityKey`] order so two of them can never wait on each other.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Identity of a lockable entity. The derived order is the acquisition order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKey {
    Vm(String),
    Pool(String),
    Network(String),
    /// An ISO image, by absolute path
    Iso(String),
    /// The port forward table as a whole
    PortForwards,
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Vm(name) => write!(f, "vm/{}", name),
            EntityKey::Pool(name) => write!(f, "pool/{}", name),
            EntityKey::Network(name) => write!(f, "network/{}", name),
            EntityKey::Iso(path) => write!(f, "iso/{}", path),
            EntityKey::PortForwards => f.write_str("port-forwards"),
        }
    }
}

/// Guard for one entity. The entity is unlocked when it is dropped.
pub type EntityGuard = OwnedMutexGuard<()>;

/// Guards for several entities, released together.
pub struct EntityGuards {
    _guards: Vec<EntityGuard>,
}

/// Lock table keyed by entity.
#[derive(Default)]
pub struct EntityLocks {
    table: Mutex<HashMap<EntityKey, Arc<AsyncMutex<()>>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &EntityKey) -> Arc<AsyncMutex<()>> {
        // The table mutex is never held across an await; recover the map if a
        // panicking thread poisoned it.
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.entry(key.clone()).or_default().clone()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: EntityKey) -> EntityGuard {
        self.slot(&key).lock_owned().await
    }

    /// Lock several entities in a deadlock-free order. Duplicates are ignored.
    pub async fn lock_many(&self, mut keys: Vec<EntityKey>) -> EntityGuards {
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock(key).await);
        }
        EntityGuards { _guards: guards }
    }

    /// Lock `key` only if nobody holds it.
    pub fn try_lock(&self, key: &EntityKey) -> Option<EntityGuard> {
        self.slot(key).try_lock_owned().ok()
    }

    /// Drop the slot of a deleted entity once no one is using it.
    pub fn forget(&self, key: &EntityKey) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = table.get(key) {
            // One reference is the table's own.
            if Arc::strong_count(slot) == 1 {
                table.remove(key);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table.lock().map(|t| t.len()).unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn is_tracked(&self, key: &EntityKey) -> bool {
        self.table.lock().map(|t| t.contains_key(key)).unwrap_or_default()
    }
}
