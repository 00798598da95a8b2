//! Overlay storage backends.
//!
//! This module provides traits and implementations for persisting overlays,
//! their content entries and their links. The primary implementation uses
//! PostgreSQL, but an in-memory implementation is provided for testing.
//!
//! Content bytes are not stored here; entries only carry references into the
//! [`ContentStore`](crate::content::ContentStore).

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::OverlayResult;
use crate::types::{ContentEntry, Link, LinkKey, OverlayRecord};

/// Everything a store holds, loaded at startup.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    /// Overlays with their entries.
    pub overlays: Vec<OverlayRecord>,
    /// Every link, enabled or not.
    pub links: Vec<Link>,
}

/// Backend for storing overlay and link records.
///
/// Every method is atomic on its own. Callers serialise mutations per overlay,
/// so implementations need not guard against interleaved writes to one overlay.
#[async_trait]
pub trait OverlayStore: Send + Sync {
    /// Insert a new, empty overlay.
    ///
    /// Returns `AlreadyExists` if the name is taken.
    async fn insert_overlay(&self, name: &str, created_at: DateTime<Utc>) -> OverlayResult<()>;

    /// Delete an overlay and its entries.
    ///
    /// With `cascade_links` the overlay's links are deleted in the same
    /// operation.
    async fn delete_overlay(&self, name: &str, cascade_links: bool) -> OverlayResult<()>;

    /// Insert or replace one content entry and record the new generation.
    async fn upsert_entry(
        &self,
        overlay: &str,
        generation: u64,
        entry: &ContentEntry,
    ) -> OverlayResult<()>;

    /// Delete one content entry and record the new generation.
    async fn delete_entry(&self, overlay: &str, generation: u64, filename: &str)
        -> OverlayResult<()>;

    /// Insert a link, or overwrite its enabled flag if it exists.
    async fn upsert_link(&self, link: &Link) -> OverlayResult<()>;

    /// Delete a link.
    async fn delete_link(&self, key: &LinkKey) -> OverlayResult<()>;

    /// Load every overlay and link.
    async fn load(&self) -> OverlayResult<StoreSnapshot>;

    /// Check that the backend is reachable.
    async fn ping(&self) -> OverlayResult<()>;
}
