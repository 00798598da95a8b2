//! HTTP executor posting redeploy commands to per-server agents.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ExecutorConfig;
use crate::error::{OverlayError, OverlayResult};
use crate::types::{ContentSnapshot, Location};

use super::RedeployExecutor;

/// Body of `POST {endpoint}/deployments/{deployment}/overlay`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeployCommand {
    /// Overlay the content came from; absent when restoring base content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay: Option<String>,
    /// Overlay generation.
    pub generation: u64,
    /// Filename to base64-encoded bytes. Empty means base content only.
    pub files: BTreeMap<String, String>,
}

impl RedeployCommand {
    /// Encode a snapshot for the wire.
    #[must_use]
    pub fn from_snapshot(snapshot: &ContentSnapshot) -> Self {
        Self {
            overlay: snapshot.overlay.clone(),
            generation: snapshot.generation,
            files: snapshot
                .files
                .iter()
                .map(|(name, bytes)| (name.clone(), STANDARD.encode(bytes)))
                .collect(),
        }
    }

    /// Decode file contents.
    pub fn decode_files(&self) -> OverlayResult<BTreeMap<String, Vec<u8>>> {
        self.files
            .iter()
            .map(|(name, encoded)| {
                STANDARD
                    .decode(encoded)
                    .map(|bytes| (name.clone(), bytes))
                    .map_err(|e| OverlayError::Serialisation(format!("invalid base64 for {name}: {e}")))
            })
            .collect()
    }
}

/// Executor that posts commands to the agent endpoint of each location.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: Client,
}

impl HttpExecutor {
    /// Create a new HTTP executor from configuration.
    ///
    /// Only the connect phase has a client-side timeout; the coordinator
    /// bounds each whole command.
    pub fn new(config: &ExecutorConfig) -> OverlayResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(OverlayError::Http)?;

        Ok(Self { client })
    }
}

#[async_trait]
impl RedeployExecutor for HttpExecutor {
    async fn apply_content_and_redeploy(
        &self,
        location: &Location,
        deployment: &str,
        snapshot: &ContentSnapshot,
    ) -> OverlayResult<()> {
        let endpoint = location.endpoint.as_deref().ok_or_else(|| {
            OverlayError::executor(format!("location {location} has no agent endpoint"))
        })?;
        let url = command_url(endpoint, deployment)?;

        debug!(
            location = %location,
            deployment,
            files = snapshot.files.len(),
            url = %url,
            "posting redeploy command"
        );

        let response = self
            .client
            .post(url)
            .json(&RedeployCommand::from_snapshot(snapshot))
            .send()
            .await
            .map_err(OverlayError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OverlayError::executor(format!(
                "agent returned {status}: {body}"
            )));
        }

        Ok(())
    }
}

/// `{endpoint}/deployments/{deployment}/overlay`, with the deployment name
/// percent-encoded as a single path segment.
fn command_url(endpoint: &str, deployment: &str) -> OverlayResult<Url> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| OverlayError::executor(format!("invalid agent endpoint {endpoint}: {e}")))?;
    url.path_segments_mut()
        .map_err(|()| OverlayError::executor(format!("agent endpoint {endpoint} cannot be a base")))?
        .pop_if_empty()
        .extend(["deployments", deployment, "overlay"]);
    Ok(url)
}
