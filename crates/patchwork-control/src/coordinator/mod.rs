//! Redeploy coordinator.
//!
//! A redeploy runs in two phases. Planning validates the request against one
//! link-table snapshot and resolves every target to its locations without
//! side effects. Execution materialises the overlay once and fans out one task
//! per location; each location applies its deployments in plan order with a
//! per-command timeout. Results are joined before the aggregate is computed.

mod validate;

pub use validate::{validate, LinkTarget, Rejection, Validation};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{LocationFailure, OverlayError, OverlayResult};
use crate::executor::RedeployExecutor;
use crate::links::{LinkIndex, LinkTable};
use crate::lock::OverlayGuard;
use crate::membership::MembershipResolver;
use crate::registry::OverlayRegistry;
use crate::types::{ContentSnapshot, LinkKey, Location, Scope};

/// Resolved work for one redeploy: deployments to apply, per location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedeployPlan {
    batches: BTreeMap<Location, Vec<String>>,
}

impl RedeployPlan {
    /// Deployments per location, in application order.
    #[must_use]
    pub fn batches(&self) -> &BTreeMap<Location, Vec<String>> {
        &self.batches
    }

    /// Number of distinct locations.
    #[must_use]
    pub fn locations(&self) -> usize {
        self.batches.len()
    }

    /// Number of (location, deployment) commands.
    #[must_use]
    pub fn commands(&self) -> usize {
        self.batches.values().map(Vec::len).sum()
    }

    /// Returns true if nothing would be redeployed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    fn add(&mut self, location: Location, deployment: &str) {
        let batch = self.batches.entry(location).or_default();
        if !batch.iter().any(|existing| existing == deployment) {
            batch.push(deployment.to_owned());
        }
    }
}

/// A command that completed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct CompletedCommand {
    /// Where it ran.
    pub location: Location,
    /// Deployment runtime name.
    pub deployment: String,
}

/// Outcome of a successful redeploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedeployReport {
    /// Overlay whose links were acted on.
    pub overlay: String,
    /// Scope of the request.
    pub scope: Scope,
    /// Overlay generation applied; 0 when restoring base content.
    pub generation: u64,
    /// True when base content was restored instead of overlay content.
    pub base_content: bool,
    /// Every completed command, sorted by location then deployment.
    pub completed: Vec<CompletedCommand>,
}

/// Validates and executes selective redeploys.
pub struct RedeployCoordinator {
    registry: Arc<OverlayRegistry>,
    links: Arc<LinkTable>,
    resolver: Arc<dyn MembershipResolver>,
    executor: Arc<dyn RedeployExecutor>,
    default_timeout: Duration,
}

impl RedeployCoordinator {
    /// Create a coordinator.
    pub fn new(
        registry: Arc<OverlayRegistry>,
        links: Arc<LinkTable>,
        resolver: Arc<dyn MembershipResolver>,
        executor: Arc<dyn RedeployExecutor>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            links,
            resolver,
            executor,
            default_timeout,
        }
    }

    /// The per-command timeout used when a request does not set one.
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Redeploy the guarded overlay's links within `scope`.
    ///
    /// `requested` restricts the call to the named deployments; `None` targets
    /// every enabled link in scope. Fails with `NotLinked` before any server
    /// is touched if a requested name has no enabled link.
    pub async fn redeploy_links(
        &self,
        guard: &OverlayGuard,
        scope: &Scope,
        requested: Option<&[String]>,
        timeout: Option<Duration>,
    ) -> OverlayResult<RedeployReport> {
        let overlay = guard.overlay();
        if !self.registry.contains(overlay) {
            return Err(OverlayError::UnknownOverlay(overlay.to_owned()));
        }

        let index = self.links.snapshot()?;
        let plan = self.plan(&index, scope, overlay, requested).await?;

        let snapshot = self.registry.materialize(guard).await?;
        info!(
            overlay,
            scope = %scope,
            generation = snapshot.generation,
            locations = plan.locations(),
            commands = plan.commands(),
            "redeploying overlay links"
        );

        self.execute(overlay, scope, &plan, Arc::new(snapshot), timeout)
            .await
    }

    /// Validate and resolve a request without executing it.
    pub async fn plan(
        &self,
        index: &LinkIndex,
        scope: &Scope,
        overlay: &str,
        requested: Option<&[String]>,
    ) -> OverlayResult<RedeployPlan> {
        match validate(index, scope, overlay, requested) {
            Validation::Validated(targets) => self.resolve(&targets).await,
            Validation::Rejected(Rejection::NotLinked { deployment }) => {
                Err(OverlayError::NotLinked {
                    scope: scope.clone(),
                    overlay: overlay.to_owned(),
                    deployment,
                })
            }
        }
    }

    /// Plan the base-content redeploy that undoes one link.
    ///
    /// A deployment no longer present in the link's scope has nothing to
    /// revert and yields an empty plan.
    pub async fn revert_plan(&self, key: &LinkKey) -> OverlayResult<RedeployPlan> {
        self.resolve(&[LinkTarget {
            scope: key.scope.clone(),
            deployment: key.deployment.clone(),
            explicit: false,
        }])
        .await
    }

    /// Redeploy a plan with base content only.
    pub async fn revert(
        &self,
        key: &LinkKey,
        plan: &RedeployPlan,
        timeout: Option<Duration>,
    ) -> OverlayResult<RedeployReport> {
        info!(
            overlay = %key.overlay,
            deployment = %key.deployment,
            scope = %key.scope,
            locations = plan.locations(),
            "reverting deployment to base content"
        );
        self.execute(
            &key.overlay,
            &key.scope,
            plan,
            Arc::new(ContentSnapshot::base()),
            timeout,
        )
        .await
    }

    async fn resolve(&self, targets: &[LinkTarget]) -> OverlayResult<RedeployPlan> {
        let mut plan = RedeployPlan::default();

        for target in targets {
            if !self
                .resolver
                .is_present(&target.deployment, &target.scope)
                .await?
            {
                if target.explicit {
                    return Err(OverlayError::DeploymentNotPresent {
                        scope: target.scope.clone(),
                        deployment: target.deployment.clone(),
                    });
                }
                warn!(
                    deployment = %target.deployment,
                    scope = %target.scope,
                    "skipping stale link: deployment not present in scope"
                );
                continue;
            }

            let locations = self
                .resolver
                .locations_for(&target.deployment, &target.scope)
                .await?;
            if locations.is_empty() {
                debug!(
                    deployment = %target.deployment,
                    scope = %target.scope,
                    "deployment has no running locations"
                );
            }
            for location in locations {
                plan.add(location, &target.deployment);
            }
        }

        Ok(plan)
    }

    async fn execute(
        &self,
        overlay: &str,
        scope: &Scope,
        plan: &RedeployPlan,
        snapshot: Arc<ContentSnapshot>,
        timeout: Option<Duration>,
    ) -> OverlayResult<RedeployReport> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let mut tasks = JoinSet::new();

        for (location, deployments) in plan.batches() {
            let executor = Arc::clone(&self.executor);
            let snapshot = Arc::clone(&snapshot);
            let location = location.clone();
            let deployments = deployments.clone();

            tasks.spawn(async move {
                let mut outcomes = Vec::with_capacity(deployments.len());
                for deployment in deployments {
                    let outcome = run_command(
                        executor.as_ref(),
                        &location,
                        &deployment,
                        &snapshot,
                        timeout,
                    )
                    .await;
                    outcomes.push((deployment, outcome));
                }
                (location, outcomes)
            });
        }

        let mut completed = Vec::new();
        let mut failures = Vec::new();

        // A panicked location task fails the whole redeploy as `Internal`.
        // Returning early drops `tasks`, which aborts locations still running.
        while let Some(joined) = tasks.join_next().await {
            let (location, outcomes) = joined.map_err(|e| {
                error!(error = %e, "redeploy task panicked");
                OverlayError::internal(format!("redeploy task failed: {e}"))
            })?;

            for (deployment, outcome) in outcomes {
                match outcome {
                    Ok(()) => completed.push(CompletedCommand {
                        location: location.clone(),
                        deployment,
                    }),
                    Err((reason, timed_out)) => failures.push(LocationFailure {
                        location: location.clone(),
                        deployment,
                        reason,
                        timed_out,
                    }),
                }
            }
        }

        completed.sort();

        if !failures.is_empty() {
            failures.sort_by(|a, b| {
                (&a.location, &a.deployment).cmp(&(&b.location, &b.deployment))
            });
            error!(
                overlay,
                scope = %scope,
                failed = failures.len(),
                completed = completed.len(),
                "redeploy failed"
            );
            return Err(OverlayError::from_failures(failures));
        }

        info!(
            overlay,
            scope = %scope,
            completed = completed.len(),
            "redeploy completed"
        );

        Ok(RedeployReport {
            overlay: overlay.to_owned(),
            scope: scope.clone(),
            generation: snapshot.generation,
            base_content: snapshot.is_base(),
            completed,
        })
    }
}

impl std::fmt::Debug for RedeployCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedeployCoordinator")
            .field("resolver", &self.resolver)
            .field("executor", &self.executor)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

async fn run_command(
    executor: &dyn RedeployExecutor,
    location: &Location,
    deployment: &str,
    snapshot: &ContentSnapshot,
    timeout: Duration,
) -> Result<(), (String, bool)> {
    let command = executor.apply_content_and_redeploy(location, deployment, snapshot);

    match tokio::time::timeout(timeout, command).await {
        Ok(Ok(())) => {
            debug!(location = %location, deployment, "redeploy command succeeded");
            Ok(())
        }
        Ok(Err(e)) => {
            warn!(location = %location, deployment, error = %e, "redeploy command failed");
            Err((e.to_string(), false))
        }
        Err(_) => {
            warn!(
                location = %location,
                deployment,
                timeout = ?timeout,
                "redeploy command timed out"
            );
            Err((format!("timed out after {timeout:?}"), true))
        }
    }
}
