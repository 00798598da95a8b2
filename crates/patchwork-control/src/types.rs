//! Core types for patchwork-control.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OverlayError, OverlayResult};

/// Maximum length for overlay, group and deployment names.
pub const MAX_NAME_LENGTH: usize = 255;

/// Maximum length for an overlay content filename.
pub const MAX_FILENAME_LENGTH: usize = 1024;

/// Granularity at which links and redeploys apply.
///
/// `Domain` covers every server group; `ServerGroup` restricts to one group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Scope {
    /// Every server group in the domain.
    Domain,
    /// A single server group.
    ServerGroup {
        /// Server group name.
        group: String,
    },
}

impl Scope {
    /// Creates a server-group scope.
    #[must_use]
    pub fn server_group(group: impl Into<String>) -> Self {
        Self::ServerGroup {
            group: group.into(),
        }
    }

    /// Returns the group name for a server-group scope.
    #[must_use]
    pub fn group(&self) -> Option<&str> {
        match self {
            Self::Domain => None,
            Self::ServerGroup { group } => Some(group),
        }
    }

    /// Returns true if a link recorded at `link_scope` is visible from this scope.
    ///
    /// The domain sees every link; a server group sees only its own.
    #[must_use]
    pub fn covers(&self, link_scope: &Self) -> bool {
        match self {
            Self::Domain => true,
            Self::ServerGroup { .. } => self == link_scope,
        }
    }

    /// Returns a string key for storage.
    #[must_use]
    pub fn to_key(&self) -> String {
        match self {
            Self::Domain => "domain".to_owned(),
            Self::ServerGroup { group } => format!("server-group:{group}"),
        }
    }

    /// Parses a storage key produced by [`Scope::to_key`].
    pub fn from_key(key: &str) -> OverlayResult<Self> {
        if key == "domain" {
            return Ok(Self::Domain);
        }
        key.strip_prefix("server-group:")
            .filter(|group| !group.is_empty())
            .map(Self::server_group)
            .ok_or_else(|| OverlayError::Serialisation(format!("unknown scope key: {key}")))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Domain => write!(f, "domain"),
            Self::ServerGroup { group } => write!(f, "server-group {group}"),
        }
    }
}

/// A server process inside a host that runs deployments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    /// Host name.
    pub host: String,
    /// Server name within the host.
    pub server: String,
    /// Agent endpoint that accepts redeploy commands, if reachable over HTTP.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl Location {
    /// Create a location without an agent endpoint.
    #[must_use]
    pub fn new(host: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            server: server.into(),
            endpoint: None,
        }
    }

    /// Attach the agent endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.server)
    }
}

/// Stable reference to stored content: the lowercase hex SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentRef(String);

impl ContentRef {
    /// Wrap an existing digest string.
    #[must_use]
    pub fn new(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    /// Get the reference as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ContentRef {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One file of an overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentEntry {
    /// Path of the file inside the deployment.
    pub filename: String,
    /// Reference into the content store.
    pub content: ContentRef,
    /// Size in bytes.
    pub size: u64,
    /// Hex SHA-256 digest of the bytes.
    pub digest: String,
    /// When this entry was last written.
    pub updated_at: DateTime<Utc>,
}

/// A persisted overlay together with its content entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayRecord {
    /// Overlay name.
    pub name: String,
    /// Content generation at the time of the last write.
    pub generation: u64,
    /// When the overlay was created.
    pub created_at: DateTime<Utc>,
    /// Content entries.
    pub entries: Vec<ContentEntry>,
}

/// Identity of a link: which deployment in which scope receives which overlay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkKey {
    /// Scope of the link.
    pub scope: Scope,
    /// Overlay name.
    pub overlay: String,
    /// Deployment runtime name.
    pub deployment: String,
}

impl LinkKey {
    /// Create a new link key.
    #[must_use]
    pub fn new(scope: Scope, overlay: impl Into<String>, deployment: impl Into<String>) -> Self {
        Self {
            scope,
            overlay: overlay.into(),
            deployment: deployment.into(),
        }
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} ({})", self.overlay, self.deployment, self.scope)
    }
}

/// A link with its enabled flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Link identity.
    #[serde(flatten)]
    pub key: LinkKey,
    /// Whether the deployment is currently eligible for redeploy.
    pub enabled: bool,
}

impl Link {
    /// Create an enabled link.
    #[must_use]
    pub const fn new(key: LinkKey) -> Self {
        Self { key, enabled: true }
    }
}

/// A deployment assigned to a server group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentInfo {
    /// Deployment name in the domain content repository.
    pub name: String,
    /// Name the deployment runs under; links refer to this name.
    pub runtime_name: String,
    /// Whether the deployment is started on the group's servers.
    pub enabled: bool,
    /// Reference to the base artifact, owned by the packaging collaborator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_content: Option<String>,
}

/// Fully materialised overlay content handed to executors.
///
/// Bytes are copied out of the content store when the snapshot is taken, so
/// later edits to the overlay never change an in-flight redeploy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContentSnapshot {
    /// Overlay the snapshot was taken from; `None` for base content.
    pub overlay: Option<String>,
    /// Overlay generation at snapshot time.
    pub generation: u64,
    /// File contents keyed by filename.
    pub files: BTreeMap<String, Bytes>,
}

impl ContentSnapshot {
    /// The empty snapshot: redeploy with base content only.
    #[must_use]
    pub fn base() -> Self {
        Self::default()
    }

    /// Returns true if applying this snapshot restores base content.
    #[must_use]
    pub fn is_base(&self) -> bool {
        self.files.is_empty()
    }
}

/// Validate an overlay, group or deployment name.
pub fn validate_name(kind: &str, name: &str) -> OverlayResult<()> {
    if name.is_empty() {
        return Err(OverlayError::invalid_name(format!("{kind} name cannot be empty")));
    }

    if name.len() > MAX_NAME_LENGTH {
        return Err(OverlayError::invalid_name(format!(
            "{kind} name exceeds maximum length of {MAX_NAME_LENGTH} characters"
        )));
    }

    if name.contains('/') || name.contains('\\') || name.chars().any(char::is_control) {
        return Err(OverlayError::invalid_name(format!(
            "{kind} name contains invalid characters: {name:?}"
        )));
    }

    Ok(())
}

/// Validate an overlay content filename.
///
/// Filenames are relative paths inside the deployment; absolute paths and
/// parent-directory segments are rejected.
pub fn validate_filename(filename: &str) -> OverlayResult<()> {
    if filename.is_empty() {
        return Err(OverlayError::invalid_name("filename cannot be empty"));
    }

    if filename.len() > MAX_FILENAME_LENGTH {
        return Err(OverlayError::invalid_name(format!(
            "filename exceeds maximum length of {MAX_FILENAME_LENGTH} characters"
        )));
    }

    if filename.starts_with('/') || filename.contains('\\') {
        return Err(OverlayError::invalid_name(format!(
            "filename must be a relative path: {filename:?}"
        )));
    }

    if filename
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(OverlayError::invalid_name(format!(
            "filename contains an empty or relative segment: {filename:?}"
        )));
    }

    Ok(())
}
