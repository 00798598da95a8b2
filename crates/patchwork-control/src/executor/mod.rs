//! Redeploy executors.
//!
//! An executor replaces a deployment's overlay content at one location and
//! redeploys it there. The HTTP executor talks to an agent on each server;
//! the mock executor simulates servers in process.

mod http;
mod mock;

pub use http::{HttpExecutor, RedeployCommand};
pub use mock::{AppliedCommand, MockExecutor};

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{ExecutorConfig, ExecutorType};
use crate::error::OverlayResult;
use crate::types::{ContentSnapshot, Location};

/// Applies overlay content to one deployment at one location.
#[async_trait]
pub trait RedeployExecutor: Send + Sync + std::fmt::Debug {
    /// Replace the deployment's overlay content with `snapshot` and redeploy it.
    ///
    /// An empty snapshot restores base content. The caller bounds the call
    /// with a timeout and drops the future when it expires.
    async fn apply_content_and_redeploy(
        &self,
        location: &Location,
        deployment: &str,
        snapshot: &ContentSnapshot,
    ) -> OverlayResult<()>;
}

/// Create an executor from configuration.
pub fn create_executor(config: &ExecutorConfig) -> OverlayResult<Arc<dyn RedeployExecutor>> {
    match config.executor_type {
        ExecutorType::Http => Ok(Arc::new(HttpExecutor::new(config)?)),
        ExecutorType::Mock => Ok(Arc::new(MockExecutor::new())),
    }
}
