//! Overlay command orchestration.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::content::ContentStore;
use crate::coordinator::{RedeployCoordinator, RedeployReport};
use crate::error::{OverlayError, OverlayResult};
use crate::executor::RedeployExecutor;
use crate::links::LinkTable;
use crate::lock::{OverlayGuard, OverlayLocks};
use crate::membership::MembershipResolver;
use crate::registry::OverlayRegistry;
use crate::store::OverlayStore;
use crate::types::{validate_name, ContentEntry, Link, LinkKey, OverlayRecord, Scope};

/// Point-in-time counters for the metrics endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    /// Number of overlays.
    pub overlays: usize,
    /// Number of links, enabled or not.
    pub links: usize,
    /// Stored objects awaiting reclaim.
    pub orphaned_content: usize,
}

/// Entry point for every overlay, link and redeploy command.
///
/// Each mutation takes the overlay's lock first, so commands against one
/// overlay run one at a time while different overlays proceed in parallel.
pub struct OverlayManager {
    locks: OverlayLocks,
    store: Arc<dyn OverlayStore>,
    content: Arc<ContentStore>,
    registry: Arc<OverlayRegistry>,
    links: Arc<LinkTable>,
    coordinator: RedeployCoordinator,
}

impl OverlayManager {
    /// Create a manager with empty in-memory state over `store`.
    ///
    /// Call [`OverlayManager::restore`] to load persisted state, or use
    /// [`OverlayManager::open`].
    pub fn new(
        store: Arc<dyn OverlayStore>,
        content: Arc<ContentStore>,
        resolver: Arc<dyn MembershipResolver>,
        executor: Arc<dyn RedeployExecutor>,
        default_timeout: Duration,
    ) -> Self {
        let registry = Arc::new(OverlayRegistry::new(
            Arc::clone(&content),
            Arc::clone(&store),
        ));
        let links = Arc::new(LinkTable::new(Arc::clone(&store)));
        let coordinator = RedeployCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&links),
            resolver,
            executor,
            default_timeout,
        );

        Self {
            locks: OverlayLocks::new(),
            store,
            content,
            registry,
            links,
            coordinator,
        }
    }

    /// Create a manager and load persisted overlays and links.
    pub async fn open(
        store: Arc<dyn OverlayStore>,
        content: Arc<ContentStore>,
        resolver: Arc<dyn MembershipResolver>,
        executor: Arc<dyn RedeployExecutor>,
        default_timeout: Duration,
    ) -> OverlayResult<Self> {
        let manager = Self::new(store, content, resolver, executor, default_timeout);
        manager.restore().await?;
        Ok(manager)
    }

    /// Replace in-memory state with what the store holds.
    pub async fn restore(&self) -> OverlayResult<()> {
        let snapshot = self.store.load().await?;
        self.registry.restore(snapshot.overlays);
        self.links.restore(snapshot.links)?;
        Ok(())
    }

    /// Create an empty overlay.
    pub async fn add_overlay(&self, name: &str) -> OverlayResult<OverlayRecord> {
        let guard = self.locks.lock(name).await;
        let created = self.registry.create(&guard).await?;
        Ok(created.to_record())
    }

    /// Remove an overlay.
    ///
    /// Fails with `HasActiveLinks` while links reference it unless `cascade`
    /// is set, in which case the links are deleted too and nothing is
    /// redeployed. Returns the number of links deleted.
    pub async fn remove_overlay(&self, name: &str, cascade: bool) -> OverlayResult<usize> {
        let guard = self.locks.lock(name).await;
        if !self.registry.contains(name) {
            return Err(OverlayError::OverlayNotFound(name.to_owned()));
        }

        let links = self.links.snapshot()?.count_for_overlay(name);
        if links > 0 && !cascade {
            return Err(OverlayError::HasActiveLinks {
                overlay: name.to_owned(),
                links,
            });
        }

        self.registry.remove(&guard, cascade).await?;
        let removed = if cascade {
            self.links.forget_overlay(&guard)?
        } else {
            0
        };

        if removed > 0 {
            warn!(overlay = %name, links = removed, "overlay links removed by cascade");
        }
        Ok(removed)
    }

    /// Insert or replace one file of an overlay.
    pub async fn put_content(
        &self,
        overlay: &str,
        filename: &str,
        data: Bytes,
    ) -> OverlayResult<ContentEntry> {
        let guard = self.locks.lock(overlay).await;
        self.registry.put_content(&guard, filename, data).await
    }

    /// Remove one file from an overlay.
    pub async fn remove_content(&self, overlay: &str, filename: &str) -> OverlayResult<()> {
        let guard = self.locks.lock(overlay).await;
        self.registry.remove_content(&guard, filename).await
    }

    /// Read back the bytes of one file.
    pub async fn get_content(&self, overlay: &str, filename: &str) -> OverlayResult<Bytes> {
        self.registry.read_content(overlay, filename).await
    }

    /// An overlay with its entries and generation.
    pub fn describe_overlay(&self, name: &str) -> OverlayResult<OverlayRecord> {
        self.registry
            .snapshot(name)
            .map(|overlay| overlay.to_record())
            .ok_or_else(|| OverlayError::OverlayNotFound(name.to_owned()))
    }

    /// Every overlay, ordered by name.
    #[must_use]
    pub fn list_overlays(&self) -> Vec<OverlayRecord> {
        self.registry
            .list()
            .iter()
            .map(|overlay| overlay.to_record())
            .collect()
    }

    /// Link a deployment to an overlay within a scope.
    ///
    /// The overlay must exist; the deployment need not. Adding an existing
    /// link changes nothing.
    pub async fn add_link(
        &self,
        scope: &Scope,
        overlay: &str,
        deployment: &str,
    ) -> OverlayResult<Link> {
        validate_scope(scope)?;
        validate_name("deployment", deployment)?;

        let guard = self.locks.lock(overlay).await;
        if !self.registry.contains(overlay) {
            return Err(OverlayError::UnknownOverlay(overlay.to_owned()));
        }

        self.links.add(&guard, scope, deployment).await?;
        let key = LinkKey::new(scope.clone(), overlay, deployment);
        let enabled = self.links.snapshot()?.get(&key).unwrap_or(true);
        Ok(Link { key, enabled })
    }

    /// Remove a link.
    ///
    /// With `redeploy_affected` the deployment is redeployed with base content
    /// at every location in the link's scope. The revert is planned before the
    /// link is removed; if it fails the link is put back and the error returned.
    pub async fn remove_link(
        &self,
        scope: &Scope,
        overlay: &str,
        deployment: &str,
        redeploy_affected: bool,
        timeout: Option<Duration>,
    ) -> OverlayResult<Option<RedeployReport>> {
        validate_scope(scope)?;
        let guard = self.locks.lock(overlay).await;

        if !redeploy_affected {
            self.links.remove(&guard, scope, deployment).await?;
            return Ok(None);
        }

        let key = LinkKey::new(scope.clone(), overlay, deployment);
        if self.links.snapshot()?.get(&key).is_none() {
            return Err(OverlayError::LinkNotFound {
                scope: key.scope,
                overlay: key.overlay,
                deployment: key.deployment,
            });
        }

        let plan = self.coordinator.revert_plan(&key).await?;
        let removed = self.links.remove(&guard, scope, deployment).await?;

        match self.coordinator.revert(&key, &plan, timeout).await {
            Ok(report) => Ok(Some(report)),
            Err(e) => {
                self.reinstate(&guard, &removed).await;
                Err(e)
            }
        }
    }

    /// Enable or disable a link.
    pub async fn set_link_enabled(
        &self,
        scope: &Scope,
        overlay: &str,
        deployment: &str,
        enabled: bool,
    ) -> OverlayResult<Link> {
        validate_scope(scope)?;
        let guard = self.locks.lock(overlay).await;
        self.links
            .set_enabled(&guard, scope, deployment, enabled)
            .await
    }

    /// Deployments with an enabled link to `overlay` visible from `scope`.
    pub fn list_links(&self, scope: &Scope, overlay: &str) -> OverlayResult<BTreeSet<String>> {
        self.links.list(scope, overlay)
    }

    /// Every link to `overlay` visible from `scope`, with enabled flags.
    pub fn describe_links(&self, scope: &Scope, overlay: &str) -> OverlayResult<Vec<Link>> {
        self.links.describe(scope, overlay)
    }

    /// Apply the overlay's current content to its linked deployments.
    ///
    /// See [`RedeployCoordinator::redeploy_links`].
    pub async fn redeploy_links(
        &self,
        scope: &Scope,
        overlay: &str,
        deployments: Option<&[String]>,
        timeout: Option<Duration>,
    ) -> OverlayResult<RedeployReport> {
        validate_scope(scope)?;
        let guard = self.locks.lock(overlay).await;
        self.coordinator
            .redeploy_links(&guard, scope, deployments, timeout)
            .await
    }

    /// Delete stored content no overlay references any more.
    pub async fn reclaim_content(&self) -> OverlayResult<usize> {
        self.content.reclaim().await
    }

    /// Check the store is reachable and return current counters.
    pub async fn ready(&self) -> OverlayResult<ManagerStats> {
        self.store.ping().await?;
        self.stats()
    }

    /// Current counters.
    pub fn stats(&self) -> OverlayResult<ManagerStats> {
        Ok(ManagerStats {
            overlays: self.registry.list().len(),
            links: self.links.snapshot()?.len(),
            orphaned_content: self.content.orphaned(),
        })
    }

    async fn reinstate(&self, guard: &OverlayGuard, link: &Link) {
        match self.links.reinstate(guard, link).await {
            Ok(()) => info!(
                overlay = %link.key.overlay,
                deployment = %link.key.deployment,
                "link restored after failed revert"
            ),
            Err(e) => error!(
                overlay = %link.key.overlay,
                deployment = %link.key.deployment,
                error = %e,
                "failed to restore link after failed revert"
            ),
        }
    }
}

impl std::fmt::Debug for OverlayManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayManager")
            .field("registry", &self.registry)
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

fn validate_scope(scope: &Scope) -> OverlayResult<()> {
    match scope.group() {
        Some(group) => validate_name("server group", group),
        None => Ok(()),
    }
}
