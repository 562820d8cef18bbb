//! Per-instance mutual exclusion.
//!
//! Leases are created lazily and only referenced weakly by the table, so an
//! instance nobody is working on holds no lock state at all.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Keyed table of per-instance locks.
#[derive(Default)]
pub struct InstanceLocks {
    table: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

/// Exclusive right to mutate one instance's migration record. Released on drop.
#[derive(Debug)]
pub struct InstanceLease {
    instance_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl InstanceLease {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the lease of an instance.
    pub async fn acquire(&self, instance_id: &str) -> InstanceLease {
        let lock = self.handle(instance_id);
        let guard = lock.lock_owned().await;
        InstanceLease {
            instance_id: instance_id.to_string(),
            _guard: guard,
        }
    }

    /// Number of instances currently holding lock state.
    pub fn len(&self) -> usize {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.retain(|_, weak| weak.strong_count() > 0);
        table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn handle(&self, instance_id: &str) -> Arc<AsyncMutex<()>> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(lock) = table.get(instance_id).and_then(Weak::upgrade) {
            return lock;
        }

        // Reclaim entries whose last lease is gone before adding a new one.
        table.retain(|_, weak| weak.strong_count() > 0);

        let lock = Arc::new(AsyncMutex::new(()));
        table.insert(instance_id.to_string(), Arc::downgrade(&lock));
        lock
    }
}
