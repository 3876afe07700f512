//! In-process exclusive leases keyed by file id.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Registry of files currently being vectorized by this process.
#[derive(Debug, Default)]
pub struct LeaseRegistry {
    held: Mutex<HashSet<Uuid>>,
}

impl LeaseRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the lease for `file_id`, or `None` when another task holds it.
    pub fn try_acquire(self: &Arc<Self>, file_id: Uuid) -> Option<Lease> {
        if self.lock().insert(file_id) {
            Some(Lease {
                registry: Arc::clone(self),
                file_id,
            })
        } else {
            None
        }
    }

    /// Whether `file_id` is currently leased.
    pub fn is_held(&self, file_id: Uuid) -> bool {
        self.lock().contains(&file_id)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive claim on one file. Released on drop.
#[derive(Debug)]
pub struct Lease {
    registry: Arc<LeaseRegistry>,
    file_id: Uuid,
}

impl Lease {
    /// Leased file.
    pub fn file_id(&self) -> Uuid {
        self.file_id
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.file_id);
    }
}
