//! Per-overlay mutation locks.
//!
//! Registry and link-table mutations take an [`OverlayGuard`] by reference, so
//! a caller must hold the overlay's lock before it can change anything that
//! belongs to that overlay. Different overlays never contend.
//!
//! Entries live only while someone holds or waits for the lock, so names that
//! never become overlays do not accumulate.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Async lock table keyed by overlay name.
#[derive(Debug, Default)]
pub struct OverlayLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl OverlayLocks {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to an overlay name.
    ///
    /// The name need not belong to an existing overlay; creating an overlay
    /// takes the lock for the new name.
    pub async fn lock(&self, overlay: &str) -> OverlayGuard {
        // Clone the Arc out so the map shard is not held across the await.
        let mutex = Arc::clone(&self.locks.entry(overlay.to_owned()).or_default());
        let guard = mutex.lock_owned().await;
        trace!(overlay, "overlay lock acquired");

        OverlayGuard {
            overlay: overlay.to_owned(),
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }
}

/// Proof of exclusive access to one overlay. Released on drop.
#[derive(Debug)]
pub struct OverlayGuard {
    overlay: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl OverlayGuard {
    /// Name of the locked overlay.
    #[must_use]
    pub fn overlay(&self) -> &str {
        &self.overlay
    }
}

impl Drop for OverlayGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold their own clone of the mutex, so a count of one means
        // the table is the last owner. `remove_if` runs under the shard lock,
        // which `lock` also takes while cloning.
        self.locks
            .remove_if(&self.overlay, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
