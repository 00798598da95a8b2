//! Link table: which deployments receive which overlay, per scope.
//!
//! The table is an immutable [`LinkIndex`] behind an `Arc`. Mutations persist
//! first and then swap in a modified copy, so [`LinkTable::snapshot`] always
//! returns one consistent view that later mutations cannot change.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::error::{OverlayError, OverlayResult};
use crate::lock::OverlayGuard;
use crate::store::OverlayStore;
use crate::types::{Link, LinkKey, Scope};

/// Immutable view of every link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkIndex {
    links: BTreeMap<LinkKey, bool>,
}

impl LinkIndex {
    /// Build an index from links.
    pub fn from_links(links: impl IntoIterator<Item = Link>) -> Self {
        Self {
            links: links
                .into_iter()
                .map(|link| (link.key, link.enabled))
                .collect(),
        }
    }

    /// The enabled flag of a link, or `None` if it does not exist.
    #[must_use]
    pub fn get(&self, key: &LinkKey) -> Option<bool> {
        self.links.get(key).copied()
    }

    /// Total number of links.
    #[must_use]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Returns true if there are no links.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Links to `overlay` visible from `scope`, enabled or not, in key order.
    pub fn visible<'a>(
        &'a self,
        scope: &'a Scope,
        overlay: &'a str,
    ) -> impl Iterator<Item = Link> + 'a {
        self.links
            .iter()
            .filter(move |(key, _)| key.overlay == overlay && scope.covers(&key.scope))
            .map(|(key, enabled)| Link {
                key: key.clone(),
                enabled: *enabled,
            })
    }

    /// Enabled links to `overlay` visible from `scope`, in key order.
    pub fn enabled<'a>(
        &'a self,
        scope: &'a Scope,
        overlay: &'a str,
    ) -> impl Iterator<Item = &'a LinkKey> + 'a {
        self.links
            .iter()
            .filter(move |(key, enabled)| {
                **enabled && key.overlay == overlay && scope.covers(&key.scope)
            })
            .map(|(key, _)| key)
    }

    /// Number of links, enabled or not, that reference `overlay` in any scope.
    #[must_use]
    pub fn count_for_overlay(&self, overlay: &str) -> usize {
        self.links.keys().filter(|key| key.overlay == overlay).count()
    }
}

/// Persistent, snapshot-able link table.
pub struct LinkTable {
    index: RwLock<Arc<LinkIndex>>,
    store: Arc<dyn OverlayStore>,
}

impl LinkTable {
    /// Create an empty link table.
    pub fn new(store: Arc<dyn OverlayStore>) -> Self {
        Self {
            index: RwLock::new(Arc::new(LinkIndex::default())),
            store,
        }
    }

    /// Replace the table with persisted links. Only call before the table is shared.
    pub fn restore(&self, links: Vec<Link>) -> OverlayResult<()> {
        let index = LinkIndex::from_links(links);
        let count = index.len();
        *self.write()? = Arc::new(index);
        info!(links = count, "link table restored");
        Ok(())
    }

    /// One consistent view of every link.
    pub fn snapshot(&self) -> OverlayResult<Arc<LinkIndex>> {
        self.index
            .read()
            .map(|index| Arc::clone(&index))
            .map_err(|_| OverlayError::internal("lock poisoned"))
    }

    /// Link `deployment` to the guarded overlay in `scope`.
    ///
    /// Returns false if the link already existed; its enabled flag is left as is.
    pub async fn add(
        &self,
        guard: &OverlayGuard,
        scope: &Scope,
        deployment: &str,
    ) -> OverlayResult<bool> {
        let key = LinkKey::new(scope.clone(), guard.overlay(), deployment);
        if self.snapshot()?.get(&key).is_some() {
            return Ok(false);
        }

        let link = Link::new(key);
        self.store.upsert_link(&link).await?;
        self.apply(|index| {
            index.links.insert(link.key.clone(), link.enabled);
        })?;

        info!(
            overlay = %link.key.overlay,
            deployment = %link.key.deployment,
            scope = %link.key.scope,
            "link added"
        );
        Ok(true)
    }

    /// Remove a link, returning it as it was.
    pub async fn remove(
        &self,
        guard: &OverlayGuard,
        scope: &Scope,
        deployment: &str,
    ) -> OverlayResult<Link> {
        let key = LinkKey::new(scope.clone(), guard.overlay(), deployment);
        let enabled = self
            .snapshot()?
            .get(&key)
            .ok_or_else(|| link_not_found(&key))?;

        self.store.delete_link(&key).await?;
        self.apply(|index| {
            index.links.remove(&key);
        })?;

        info!(
            overlay = %key.overlay,
            deployment = %key.deployment,
            scope = %key.scope,
            "link removed"
        );
        Ok(Link { key, enabled })
    }

    /// Put back a link previously returned by [`LinkTable::remove`].
    pub async fn reinstate(&self, guard: &OverlayGuard, link: &Link) -> OverlayResult<()> {
        if link.key.overlay != guard.overlay() {
            return Err(OverlayError::internal(format!(
                "guard for {} cannot reinstate a link of {}",
                guard.overlay(),
                link.key.overlay
            )));
        }

        self.store.upsert_link(link).await?;
        self.apply(|index| {
            index.links.insert(link.key.clone(), link.enabled);
        })?;

        info!(
            overlay = %link.key.overlay,
            deployment = %link.key.deployment,
            scope = %link.key.scope,
            "link reinstated"
        );
        Ok(())
    }

    /// Enable or disable an existing link.
    pub async fn set_enabled(
        &self,
        guard: &OverlayGuard,
        scope: &Scope,
        deployment: &str,
        enabled: bool,
    ) -> OverlayResult<Link> {
        let key = LinkKey::new(scope.clone(), guard.overlay(), deployment);
        let current = self
            .snapshot()?
            .get(&key)
            .ok_or_else(|| link_not_found(&key))?;

        let link = Link { key, enabled };
        if current == enabled {
            return Ok(link);
        }

        self.store.upsert_link(&link).await?;
        self.apply(|index| {
            index.links.insert(link.key.clone(), enabled);
        })?;

        info!(
            overlay = %link.key.overlay,
            deployment = %link.key.deployment,
            scope = %link.key.scope,
            enabled,
            "link updated"
        );
        Ok(link)
    }

    /// Drop the guarded overlay's links from memory after the store deleted them.
    pub fn forget_overlay(&self, guard: &OverlayGuard) -> OverlayResult<usize> {
        let overlay = guard.overlay();
        let mut removed = 0;
        self.apply(|index| {
            let before = index.links.len();
            index.links.retain(|key, _| key.overlay != overlay);
            removed = before - index.links.len();
        })?;
        Ok(removed)
    }

    /// Deployments with an enabled link to `overlay` visible from `scope`.
    ///
    /// From the domain scope this is the union of domain-level and group links.
    pub fn list(&self, scope: &Scope, overlay: &str) -> OverlayResult<BTreeSet<String>> {
        let index = self.snapshot()?;
        Ok(index
            .enabled(scope, overlay)
            .map(|key| key.deployment.clone())
            .collect())
    }

    /// Every link to `overlay` visible from `scope`, with its enabled flag.
    pub fn describe(&self, scope: &Scope, overlay: &str) -> OverlayResult<Vec<Link>> {
        let index = self.snapshot()?;
        Ok(index.visible(scope, overlay).collect())
    }

    fn write(&self) -> OverlayResult<std::sync::RwLockWriteGuard<'_, Arc<LinkIndex>>> {
        self.index
            .write()
            .map_err(|_| OverlayError::internal("lock poisoned"))
    }

    fn apply(&self, change: impl FnOnce(&mut LinkIndex)) -> OverlayResult<()> {
        let mut index = self.write()?;
        let mut next = LinkIndex::clone(&index);
        change(&mut next);
        *index = Arc::new(next);
        Ok(())
    }
}

impl std::fmt::Debug for LinkTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkTable").finish_non_exhaustive()
    }
}

fn link_not_found(key: &LinkKey) -> OverlayError {
    OverlayError::LinkNotFound {
        scope: key.scope.clone(),
        overlay: key.overlay.clone(),
        deployment: key.deployment.clone(),
    }
}
