//! Overlay registry.
//!
//! Each overlay is held as an immutable [`OverlayContent`] behind an `Arc`.
//! Writers build a modified copy and swap it in, so a reader holding an older
//! `Arc` keeps a consistent view for as long as it needs one.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info};

use crate::content::ContentStore;
use crate::error::{OverlayError, OverlayResult};
use crate::lock::OverlayGuard;
use crate::store::OverlayStore;
use crate::types::{validate_filename, validate_name, ContentEntry, ContentSnapshot, OverlayRecord};

/// Immutable view of one overlay at one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayContent {
    /// Overlay name.
    pub name: String,
    /// Bumped on every content change.
    pub generation: u64,
    /// When the overlay was created.
    pub created_at: DateTime<Utc>,
    /// Entries keyed by filename.
    pub entries: BTreeMap<String, ContentEntry>,
}

impl OverlayContent {
    fn empty(name: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            name: name.to_owned(),
            generation: 0,
            created_at,
            entries: BTreeMap::new(),
        }
    }

    /// Convert to the persisted/serialisable form.
    #[must_use]
    pub fn to_record(&self) -> OverlayRecord {
        OverlayRecord {
            name: self.name.clone(),
            generation: self.generation,
            created_at: self.created_at,
            entries: self.entries.values().cloned().collect(),
        }
    }
}

impl From<OverlayRecord> for OverlayContent {
    fn from(record: OverlayRecord) -> Self {
        Self {
            name: record.name,
            generation: record.generation,
            created_at: record.created_at,
            entries: record
                .entries
                .into_iter()
                .map(|entry| (entry.filename.clone(), entry))
                .collect(),
        }
    }
}

/// Domain-wide catalog of overlays.
pub struct OverlayRegistry {
    overlays: DashMap<String, Arc<OverlayContent>>,
    content: Arc<ContentStore>,
    store: Arc<dyn OverlayStore>,
}

impl OverlayRegistry {
    /// Create an empty registry.
    pub fn new(content: Arc<ContentStore>, store: Arc<dyn OverlayStore>) -> Self {
        Self {
            overlays: DashMap::new(),
            content,
            store,
        }
    }

    /// Replace the registry contents with persisted records.
    ///
    /// Takes one content reference per entry. Only call before the registry
    /// is shared.
    pub fn restore(&self, records: Vec<OverlayRecord>) {
        self.overlays.clear();
        for record in records {
            for entry in &record.entries {
                self.content.retain(&entry.content);
            }
            self.overlays
                .insert(record.name.clone(), Arc::new(OverlayContent::from(record)));
        }
        info!(overlays = self.overlays.len(), "overlay registry restored");
    }

    /// Returns true if the overlay exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.overlays.contains_key(name)
    }

    /// The current view of an overlay.
    #[must_use]
    pub fn snapshot(&self, name: &str) -> Option<Arc<OverlayContent>> {
        self.overlays.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Every overlay, ordered by name.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<OverlayContent>> {
        let mut overlays: Vec<_> = self
            .overlays
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        overlays.sort_by(|a, b| a.name.cmp(&b.name));
        overlays
    }

    /// Create an empty overlay under the guard's name.
    pub async fn create(&self, guard: &OverlayGuard) -> OverlayResult<Arc<OverlayContent>> {
        let name = guard.overlay();
        validate_name("overlay", name)?;

        if self.contains(name) {
            return Err(OverlayError::AlreadyExists(name.to_owned()));
        }

        let created = Arc::new(OverlayContent::empty(name, Utc::now()));
        self.store.insert_overlay(name, created.created_at).await?;
        self.overlays.insert(name.to_owned(), Arc::clone(&created));

        info!(overlay = %name, "overlay created");
        Ok(created)
    }

    /// Remove the overlay and release its content.
    ///
    /// Link checks are the caller's responsibility; `cascade_links` is passed
    /// through so the store drops the links in the same operation.
    pub async fn remove(
        &self,
        guard: &OverlayGuard,
        cascade_links: bool,
    ) -> OverlayResult<Arc<OverlayContent>> {
        let name = guard.overlay();
        if !self.contains(name) {
            return Err(OverlayError::OverlayNotFound(name.to_owned()));
        }

        self.store.delete_overlay(name, cascade_links).await?;

        let (_, removed) = self
            .overlays
            .remove(name)
            .ok_or_else(|| OverlayError::OverlayNotFound(name.to_owned()))?;
        for entry in removed.entries.values() {
            self.content.release(&entry.content);
        }

        info!(overlay = %name, entries = removed.entries.len(), "overlay removed");
        Ok(removed)
    }

    /// Insert or replace one file of the overlay.
    pub async fn put_content(
        &self,
        guard: &OverlayGuard,
        filename: &str,
        data: Bytes,
    ) -> OverlayResult<ContentEntry> {
        let name = guard.overlay();
        validate_filename(filename)?;
        let current = self.current(name)?;

        let stored = self.content.put(data).await?;
        let entry = ContentEntry {
            filename: filename.to_owned(),
            digest: stored.content.to_string(),
            content: stored.content,
            size: stored.size,
            updated_at: Utc::now(),
        };

        let mut next = OverlayContent::clone(&current);
        next.generation += 1;

        if let Err(e) = self.store.upsert_entry(name, next.generation, &entry).await {
            self.content.release(&entry.content);
            return Err(e);
        }

        let previous = next.entries.insert(filename.to_owned(), entry.clone());
        let generation = next.generation;
        self.overlays.insert(name.to_owned(), Arc::new(next));

        if let Some(previous) = previous {
            self.content.release(&previous.content);
        }

        info!(
            overlay = %name,
            filename,
            size = entry.size,
            generation,
            "overlay content stored"
        );
        Ok(entry)
    }

    /// Remove one file from the overlay.
    pub async fn remove_content(&self, guard: &OverlayGuard, filename: &str) -> OverlayResult<()> {
        let name = guard.overlay();
        let current = self.current(name)?;

        let mut next = OverlayContent::clone(&current);
        let removed = next
            .entries
            .remove(filename)
            .ok_or_else(|| OverlayError::ContentNotFound {
                overlay: name.to_owned(),
                filename: filename.to_owned(),
            })?;
        next.generation += 1;

        self.store
            .delete_entry(name, next.generation, filename)
            .await?;

        let generation = next.generation;
        self.overlays.insert(name.to_owned(), Arc::new(next));
        self.content.release(&removed.content);

        info!(overlay = %name, filename, generation, "overlay content removed");
        Ok(())
    }

    /// Read back the bytes of one file.
    pub async fn read_content(&self, name: &str, filename: &str) -> OverlayResult<Bytes> {
        let current = self.current(name)?;
        let entry = current
            .entries
            .get(filename)
            .ok_or_else(|| OverlayError::ContentNotFound {
                overlay: name.to_owned(),
                filename: filename.to_owned(),
            })?;

        self.content.get(&entry.content).await
    }

    /// Copy every file of the overlay out of the content store.
    ///
    /// Holding the guard keeps the entries from being replaced and reclaimed
    /// while the bytes are read.
    pub async fn materialize(&self, guard: &OverlayGuard) -> OverlayResult<ContentSnapshot> {
        let current = self.current(guard.overlay())?;

        let mut files = BTreeMap::new();
        for (filename, entry) in &current.entries {
            files.insert(filename.clone(), self.content.get(&entry.content).await?);
        }

        debug!(
            overlay = %current.name,
            generation = current.generation,
            files = files.len(),
            "overlay content materialised"
        );

        Ok(ContentSnapshot {
            overlay: Some(current.name.clone()),
            generation: current.generation,
            files,
        })
    }

    fn current(&self, name: &str) -> OverlayResult<Arc<OverlayContent>> {
        self.snapshot(name)
            .ok_or_else(|| OverlayError::OverlayNotFound(name.to_owned()))
    }
}

impl std::fmt::Debug for OverlayRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayRegistry")
            .field("overlays", &self.overlays.len())
            .finish_non_exhaustive()
    }
}
