//! Patchwork control plane
//!
//! This crate manages deployment overlays: named sets of files that are
//! layered over a deployment's base content and applied by redeploying the
//! deployment at every server that runs it.
//!
//! # Architecture
//!
//! The control plane is built from a few small parts:
//!
//! - **Content store**: content-addressed file bytes in an object store,
//!   reference counted so replaced content can be reclaimed
//! - **Overlay registry**: overlay names, their files and a generation that
//!   increases on every change
//! - **Link table**: which deployments an overlay is linked to, at domain or
//!   server-group scope
//! - **Redeploy coordinator**: validates a redeploy request against the links,
//!   plans one batch per location and runs the batches in parallel
//! - **API surface**: HTTP endpoints over all of the above
//!
//! Every mutation of an overlay, its content or its links goes through
//! [`OverlayManager`], which serialises commands per overlay name.
//!
//! # Scope visibility
//!
//! ```text
//! domain ──covers──▶ server-group:main-server-group
//!        └─covers──▶ server-group:other-server-group
//! ```
//!
//! A request at domain scope sees every link. A request at server-group scope
//! sees only that group's links.
//!
//! # Example
//!
//! ```ignore
//! use patchwork_control::{OverlayManager, Scope};
//!
//! manager.add_overlay("test-overlay").await?;
//! manager
//!     .put_content("test-overlay", "service.properties", "service=is added".into())
//!     .await?;
//!
//! let group = Scope::server_group("main-server-group");
//! manager.add_link(&group, "test-overlay", "main-deployment.jar").await?;
//!
//! let report = manager
//!     .redeploy_links(&group, "test-overlay", None, None)
//!     .await?;
//! assert!(!report.completed.is_empty());
//! ```

#![forbid(unsafe_code)]

pub mod api;
pub mod config;
pub mod content;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod links;
pub mod lock;
pub mod membership;
pub mod overlay;
pub mod registry;
pub mod service;
pub mod store;
pub mod types;

pub use config::ControlConfig;
pub use content::ContentStore;
pub use coordinator::{RedeployCoordinator, RedeployPlan, RedeployReport};
pub use error::{ErrorKind, LocationFailure, OverlayError, OverlayResult};
pub use executor::{HttpExecutor, MockExecutor, RedeployExecutor};
pub use membership::{MembershipResolver, StaticMembership};
pub use overlay::{ManagerStats, OverlayManager};
pub use service::ControlService;
pub use store::{MemoryStore, OverlayStore, PostgresStore};
pub use types::{
    ContentEntry, ContentRef, ContentSnapshot, DeploymentInfo, Link, LinkKey, Location,
    OverlayRecord, Scope,
};
