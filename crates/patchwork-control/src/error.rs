//! Error types for patchwork-control.

use std::fmt;

use serde::Serialize;

use crate::types::{Location, Scope};

/// Result type alias using [`OverlayError`].
pub type OverlayResult<T> = Result<T, OverlayError>;

/// Errors returned by the overlay control plane.
///
/// Every variant maps onto a machine-checkable [`ErrorKind`] so callers can
/// branch on the failure class without matching message text.
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    /// An overlay with this name already exists.
    #[error("overlay already exists: {0}")]
    AlreadyExists(String),

    /// The overlay named by a mutation does not exist.
    #[error("overlay not found: {0}")]
    OverlayNotFound(String),

    /// The overlay has no content entry for this filename.
    #[error("content {filename} not found in overlay {overlay}")]
    ContentNotFound {
        /// Overlay name.
        overlay: String,
        /// Filename within the overlay.
        filename: String,
    },

    /// No stored object exists for a content reference.
    #[error("content object not found: {0}")]
    ObjectNotFound(String),

    /// The link does not exist.
    #[error("no link from overlay {overlay} to {deployment} in {scope}")]
    LinkNotFound {
        /// Scope of the link.
        scope: Scope,
        /// Overlay name.
        overlay: String,
        /// Deployment runtime name.
        deployment: String,
    },

    /// A linked deployment is not present in its scope.
    #[error("deployment {deployment} is not present in {scope}")]
    DeploymentNotPresent {
        /// Scope that was searched.
        scope: Scope,
        /// Deployment runtime name.
        deployment: String,
    },

    /// A link refers to an overlay that does not exist.
    #[error("unknown overlay: {0}")]
    UnknownOverlay(String),

    /// A redeploy request named a deployment that is not linked.
    #[error("invalid redeploy request: deployment {deployment} is not linked to overlay {overlay} in {scope}")]
    NotLinked {
        /// Scope of the request.
        scope: Scope,
        /// Overlay name.
        overlay: String,
        /// First offending deployment name.
        deployment: String,
    },

    /// The overlay is still referenced by links.
    #[error("overlay {overlay} still has {links} active link(s)")]
    HasActiveLinks {
        /// Overlay name.
        overlay: String,
        /// Number of links referencing it.
        links: usize,
    },

    /// One or more redeploy commands failed.
    #[error("redeploy failed at {} location(s): {}", .failures.len(), FailureList(.failures))]
    LocationFailure {
        /// Every failed command.
        failures: Vec<LocationFailure>,
    },

    /// Every failed redeploy command timed out.
    #[error("redeploy timed out at {} location(s): {}", .failures.len(), FailureList(.failures))]
    Timeout {
        /// Every timed-out command.
        failures: Vec<LocationFailure>,
    },

    /// A name or filename failed validation.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Object store error.
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Redeploy executor error for a single command.
    #[error("executor error: {0}")]
    Executor(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl OverlayError {
    /// Create an executor error.
    #[must_use]
    pub fn executor(msg: impl Into<String>) -> Self {
        Self::Executor(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid-name error.
    #[must_use]
    pub fn invalid_name(msg: impl Into<String>) -> Self {
        Self::InvalidName(msg.into())
    }

    /// Build the aggregate error for a set of failed commands.
    ///
    /// Returns [`OverlayError::Timeout`] only when every failure timed out.
    #[must_use]
    pub fn from_failures(failures: Vec<LocationFailure>) -> Self {
        if !failures.is_empty() && failures.iter().all(|f| f.timed_out) {
            Self::Timeout { failures }
        } else {
            Self::LocationFailure { failures }
        }
    }

    /// The machine-checkable kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::OverlayNotFound(_)
            | Self::ContentNotFound { .. }
            | Self::ObjectNotFound(_)
            | Self::LinkNotFound { .. }
            | Self::DeploymentNotPresent { .. } => ErrorKind::NotFound,
            Self::UnknownOverlay(_) => ErrorKind::UnknownOverlay,
            Self::NotLinked { .. } => ErrorKind::NotLinked,
            Self::HasActiveLinks { .. } => ErrorKind::HasActiveLinks,
            Self::LocationFailure { .. } => ErrorKind::LocationFailure,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::InvalidName(_) => ErrorKind::InvalidName,
            Self::Database(_) | Self::ObjectStore(_) => ErrorKind::Storage,
            Self::Http(_) | Self::Executor(_) => ErrorKind::LocationFailure,
            Self::Config(_) => ErrorKind::Config,
            Self::Serialisation(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Failed commands carried by an aggregate redeploy error.
    #[must_use]
    pub fn failures(&self) -> &[LocationFailure] {
        match self {
            Self::LocationFailure { failures } | Self::Timeout { failures } => failures,
            _ => &[],
        }
    }
}

/// Machine-checkable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Name already taken.
    AlreadyExists,
    /// Overlay, content, link or deployment absent.
    NotFound,
    /// Link target overlay absent.
    UnknownOverlay,
    /// Redeploy batch named an unlinked deployment.
    NotLinked,
    /// Overlay removal blocked by links.
    HasActiveLinks,
    /// At least one redeploy command failed.
    LocationFailure,
    /// Every failed redeploy command timed out.
    Timeout,
    /// Rejected name or filename.
    InvalidName,
    /// Persistence backend failure.
    Storage,
    /// Invalid configuration.
    Config,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Get the kind name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyExists => "already_exists",
            Self::NotFound => "not_found",
            Self::UnknownOverlay => "unknown_overlay",
            Self::NotLinked => "not_linked",
            Self::HasActiveLinks => "has_active_links",
            Self::LocationFailure => "location_failure",
            Self::Timeout => "timeout",
            Self::InvalidName => "invalid_name",
            Self::Storage => "storage",
            Self::Config => "config",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single failed redeploy command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocationFailure {
    /// Where the command ran.
    pub location: Location,
    /// Deployment runtime name.
    pub deployment: String,
    /// Human-readable failure reason.
    pub reason: String,
    /// Whether the command was abandoned on timeout.
    pub timed_out: bool,
}

impl fmt::Display for LocationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}: {}", self.deployment, self.location, self.reason)
    }
}

struct FailureList<'a>(&'a [LocationFailure]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}
