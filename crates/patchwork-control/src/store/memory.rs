//! In-memory overlay store for testing.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{OverlayError, OverlayResult};
use crate::types::{ContentEntry, Link, LinkKey, OverlayRecord};

use super::{OverlayStore, StoreSnapshot};

/// In-memory overlay store for testing.
///
/// Data is lost when the process exits. Sharing one instance between two
/// managers through an `Arc` simulates a restart against the same database.
#[derive(Debug, Default)]
pub struct MemoryStore {
    overlays: RwLock<BTreeMap<String, OverlayRecord>>,
    links: RwLock<BTreeMap<LinkKey, bool>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OverlayStore for MemoryStore {
    async fn insert_overlay(&self, name: &str, created_at: DateTime<Utc>) -> OverlayResult<()> {
        let mut overlays = self
            .overlays
            .write()
            .map_err(|_| OverlayError::internal("lock poisoned"))?;

        if overlays.contains_key(name) {
            return Err(OverlayError::AlreadyExists(name.to_owned()));
        }

        overlays.insert(
            name.to_owned(),
            OverlayRecord {
                name: name.to_owned(),
                generation: 0,
                created_at,
                entries: Vec::new(),
            },
        );
        Ok(())
    }

    async fn delete_overlay(&self, name: &str, cascade_links: bool) -> OverlayResult<()> {
        let mut overlays = self
            .overlays
            .write()
            .map_err(|_| OverlayError::internal("lock poisoned"))?;
        let mut links = self
            .links
            .write()
            .map_err(|_| OverlayError::internal("lock poisoned"))?;

        if overlays.remove(name).is_none() {
            return Err(OverlayError::OverlayNotFound(name.to_owned()));
        }
        if cascade_links {
            links.retain(|key, _| key.overlay != name);
        }
        Ok(())
    }

    async fn upsert_entry(
        &self,
        overlay: &str,
        generation: u64,
        entry: &ContentEntry,
    ) -> OverlayResult<()> {
        let mut overlays = self
            .overlays
            .write()
            .map_err(|_| OverlayError::internal("lock poisoned"))?;

        let record = overlays
            .get_mut(overlay)
            .ok_or_else(|| OverlayError::OverlayNotFound(overlay.to_owned()))?;

        match record
            .entries
            .iter_mut()
            .find(|existing| existing.filename == entry.filename)
        {
            Some(existing) => *existing = entry.clone(),
            None => record.entries.push(entry.clone()),
        }
        record.generation = generation;
        Ok(())
    }

    async fn delete_entry(
        &self,
        overlay: &str,
        generation: u64,
        filename: &str,
    ) -> OverlayResult<()> {
        let mut overlays = self
            .overlays
            .write()
            .map_err(|_| OverlayError::internal("lock poisoned"))?;

        let record = overlays
            .get_mut(overlay)
            .ok_or_else(|| OverlayError::OverlayNotFound(overlay.to_owned()))?;

        let before = record.entries.len();
        record.entries.retain(|entry| entry.filename != filename);
        if record.entries.len() == before {
            return Err(OverlayError::ContentNotFound {
                overlay: overlay.to_owned(),
                filename: filename.to_owned(),
            });
        }
        record.generation = generation;
        Ok(())
    }

    async fn upsert_link(&self, link: &Link) -> OverlayResult<()> {
        let mut links = self
            .links
            .write()
            .map_err(|_| OverlayError::internal("lock poisoned"))?;

        links.insert(link.key.clone(), link.enabled);
        Ok(())
    }

    async fn delete_link(&self, key: &LinkKey) -> OverlayResult<()> {
        let mut links = self
            .links
            .write()
            .map_err(|_| OverlayError::internal("lock poisoned"))?;

        links
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| OverlayError::LinkNotFound {
                scope: key.scope.clone(),
                overlay: key.overlay.clone(),
                deployment: key.deployment.clone(),
            })
    }

    async fn load(&self) -> OverlayResult<StoreSnapshot> {
        let overlays = self
            .overlays
            .read()
            .map_err(|_| OverlayError::internal("lock poisoned"))?;
        let links = self
            .links
            .read()
            .map_err(|_| OverlayError::internal("lock poisoned"))?;

        Ok(StoreSnapshot {
            overlays: overlays.values().cloned().collect(),
            links: links
                .iter()
                .map(|(key, enabled)| Link {
                    key: key.clone(),
                    enabled: *enabled,
                })
                .collect(),
        })
    }

    async fn ping(&self) -> OverlayResult<()> {
        Ok(())
    }
}
