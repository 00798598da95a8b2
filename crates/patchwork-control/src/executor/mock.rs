//! In-process executor simulating running servers.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::error::{OverlayError, OverlayResult};
use crate::types::{ContentSnapshot, Location};

use super::RedeployExecutor;

/// One command the mock executor completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedCommand {
    /// Where it ran.
    pub location: Location,
    /// Deployment runtime name.
    pub deployment: String,
    /// Overlay applied, `None` for base content.
    pub overlay: Option<String>,
    /// Overlay generation applied.
    pub generation: u64,
}

#[derive(Debug, Clone, Default)]
struct RunningDeployment {
    base: BTreeMap<String, Bytes>,
    overlay: BTreeMap<String, Bytes>,
    redeploys: u64,
}

type DeploymentKey = (Location, String);

/// Mock executor for testing.
///
/// Each (location, deployment) runs its base content with the last applied
/// overlay layered on top. Failures and delays can be injected per location.
#[derive(Debug, Default)]
pub struct MockExecutor {
    running: RwLock<HashMap<DeploymentKey, RunningDeployment>>,
    failures: RwLock<HashMap<Location, String>>,
    delays: RwLock<HashMap<Location, Duration>>,
    applied: RwLock<Vec<AppliedCommand>>,
}

impl MockExecutor {
    /// Create a mock executor with no running deployments.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `deployment` at `location` with base files and no overlay.
    pub fn deploy_base(
        &self,
        location: &Location,
        deployment: &str,
        files: impl IntoIterator<Item = (String, Bytes)>,
    ) -> OverlayResult<()> {
        let mut running = self
            .running
            .write()
            .map_err(|_| OverlayError::internal("lock poisoned"))?;

        running.insert(
            (location.clone(), deployment.to_owned()),
            RunningDeployment {
                base: files.into_iter().collect(),
                ..RunningDeployment::default()
            },
        );
        Ok(())
    }

    /// The files the deployment serves: base content overlaid with the
    /// applied overlay. `None` if it was never deployed at the location.
    pub fn running_content(
        &self,
        location: &Location,
        deployment: &str,
    ) -> OverlayResult<Option<BTreeMap<String, Bytes>>> {
        let running = self
            .running
            .read()
            .map_err(|_| OverlayError::internal("lock poisoned"))?;

        Ok(running
            .get(&(location.clone(), deployment.to_owned()))
            .map(|state| {
                let mut files = state.base.clone();
                files.extend(
                    state
                        .overlay
                        .iter()
                        .map(|(name, bytes)| (name.clone(), bytes.clone())),
                );
                files
            }))
    }

    /// How many times the deployment was redeployed at the location.
    pub fn redeploy_count(&self, location: &Location, deployment: &str) -> OverlayResult<u64> {
        let running = self
            .running
            .read()
            .map_err(|_| OverlayError::internal("lock poisoned"))?;

        Ok(running
            .get(&(location.clone(), deployment.to_owned()))
            .map_or(0, |state| state.redeploys))
    }

    /// Every completed command, in completion order.
    pub fn applied(&self) -> OverlayResult<Vec<AppliedCommand>> {
        self.applied
            .read()
            .map(|applied| applied.clone())
            .map_err(|_| OverlayError::internal("lock poisoned"))
    }

    /// Make every command at `location` fail with `reason`.
    pub fn fail_at(&self, location: &Location, reason: impl Into<String>) -> OverlayResult<()> {
        self.failures
            .write()
            .map_err(|_| OverlayError::internal("lock poisoned"))?
            .insert(location.clone(), reason.into());
        Ok(())
    }

    /// Make every command at `location` sleep for `delay` before applying.
    pub fn delay_at(&self, location: &Location, delay: Duration) -> OverlayResult<()> {
        self.delays
            .write()
            .map_err(|_| OverlayError::internal("lock poisoned"))?
            .insert(location.clone(), delay);
        Ok(())
    }

    /// Remove every injected failure and delay.
    pub fn heal(&self) -> OverlayResult<()> {
        self.failures
            .write()
            .map_err(|_| OverlayError::internal("lock poisoned"))?
            .clear();
        self.delays
            .write()
            .map_err(|_| OverlayError::internal("lock poisoned"))?
            .clear();
        Ok(())
    }

    fn injected(&self, location: &Location) -> OverlayResult<(Option<Duration>, Option<String>)> {
        let delay = self
            .delays
            .read()
            .map_err(|_| OverlayError::internal("lock poisoned"))?
            .get(location)
            .copied();
        let failure = self
            .failures
            .read()
            .map_err(|_| OverlayError::internal("lock poisoned"))?
            .get(location)
            .cloned();
        Ok((delay, failure))
    }
}

#[async_trait]
impl RedeployExecutor for MockExecutor {
    async fn apply_content_and_redeploy(
        &self,
        location: &Location,
        deployment: &str,
        snapshot: &ContentSnapshot,
    ) -> OverlayResult<()> {
        let (delay, failure) = self.injected(location)?;

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = failure {
            return Err(OverlayError::executor(reason));
        }

        {
            let mut running = self
                .running
                .write()
                .map_err(|_| OverlayError::internal("lock poisoned"))?;
            let state = running
                .entry((location.clone(), deployment.to_owned()))
                .or_default();
            state.overlay = snapshot.files.clone();
            state.redeploys += 1;
        }

        self.applied
            .write()
            .map_err(|_| OverlayError::internal("lock poisoned"))?
            .push(AppliedCommand {
                location: location.clone(),
                deployment: deployment.to_owned(),
                overlay: snapshot.overlay.clone(),
                generation: snapshot.generation,
            });

        debug!(
            location = %location,
            deployment,
            files = snapshot.files.len(),
            "mock redeploy applied"
        );
        Ok(())
    }
}
