//! Configuration for patchwork-control.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{OverlayError, OverlayResult};

/// Top-level configuration for the control service.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ControlConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Overlay and link persistence.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Overlay content storage.
    #[serde(default)]
    pub content: ContentConfig,

    /// Server groups, their members and deployments.
    #[serde(default)]
    pub topology: TopologyConfig,

    /// How redeploy commands reach servers.
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Redeploy behaviour.
    #[serde(default)]
    pub redeploy: RedeployConfig,
}

impl ControlConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `control.toml` in the current directory (if present)
    /// 3. Environment variables with `PATCHWORK_` prefix
    pub fn load() -> OverlayResult<Self> {
        Figment::new()
            .merge(Toml::file("control.toml"))
            .merge(Env::prefixed("PATCHWORK_").split("__"))
            .extract()
            .map_err(|e| OverlayError::Config(e.to_string()))
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> OverlayResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PATCHWORK_").split("__"))
            .extract()
            .map_err(|e| OverlayError::Config(e.to_string()))
    }
}

/// Transport endpoint for the HTTP API.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Transport {
    /// Unix domain socket transport.
    Unix {
        /// Path to the Unix socket.
        path: PathBuf,
    },
    /// TCP transport.
    Tcp {
        /// Socket address (IP and port).
        addr: SocketAddr,
    },
}

impl Transport {
    /// Creates a Unix socket transport.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// Creates a TCP transport.
    pub const fn tcp(addr: SocketAddr) -> Self {
        Self::Tcp { addr }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix { path } => write!(f, "unix:{}", path.display()),
            Self::Tcp { addr } => write!(f, "tcp:{addr}"),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Transport to listen on (TCP or Unix socket).
    #[serde(default = "default_listen")]
    pub listen: Transport,

    /// Maximum accepted request body (overlay content uploads) in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_listen() -> Transport {
    Transport::tcp(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9990))
}

const fn default_max_body_bytes() -> usize {
    16 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Which overlay store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreType {
    /// PostgreSQL, falling back to memory if unreachable.
    #[default]
    Postgres,

    /// In-memory store; state is lost on restart.
    Memory,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Backend selection.
    #[serde(default)]
    pub store_type: StoreType,

    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_database_url() -> String {
    "postgres://localhost/patchwork".to_owned()
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            store_type: StoreType::default(),
            url: default_database_url(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Backend holding overlay content bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentStoreType {
    /// Local filesystem directory.
    #[default]
    Local,
    /// In-memory; content is lost on restart.
    Memory,
    /// S3-compatible bucket.
    S3,
}

/// Overlay content storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentConfig {
    /// Backend selection.
    #[serde(default)]
    pub store_type: ContentStoreType,

    /// Directory (local) or bucket name (S3).
    #[serde(default = "default_content_path")]
    pub path: String,

    /// Key prefix for content objects.
    #[serde(default = "default_content_prefix")]
    pub prefix: String,

    /// S3 endpoint URL (for S3-compatible stores).
    pub endpoint: Option<String>,

    /// S3 region.
    pub region: Option<String>,

    /// S3 access key ID.
    pub access_key_id: Option<String>,

    /// S3 secret access key.
    pub secret_access_key: Option<String>,
}

fn default_content_path() -> String {
    "/var/lib/patchwork/content".to_owned()
}

fn default_content_prefix() -> String {
    "overlay-content".to_owned()
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            store_type: ContentStoreType::default(),
            path: default_content_path(),
            prefix: default_content_prefix(),
            endpoint: None,
            region: None,
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

/// Static domain topology.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TopologyConfig {
    /// Server groups in the domain.
    #[serde(default)]
    pub groups: Vec<ServerGroupConfig>,
}

/// One server group.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerGroupConfig {
    /// Group name.
    pub name: String,

    /// Servers that belong to the group.
    #[serde(default)]
    pub members: Vec<MemberConfig>,

    /// Deployments assigned to the group.
    #[serde(default)]
    pub deployments: Vec<GroupDeploymentConfig>,
}

/// A (host, server) member of a group.
#[derive(Debug, Clone, Deserialize)]
pub struct MemberConfig {
    /// Host name.
    pub host: String,
    /// Server name.
    pub server: String,
    /// Agent endpoint receiving redeploy commands.
    pub endpoint: Option<String>,
}

/// A deployment assigned to a group.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupDeploymentConfig {
    /// Deployment name.
    pub name: String,
    /// Runtime name; defaults to `name`.
    pub runtime_name: Option<String>,
    /// Whether the deployment is started.
    #[serde(default = "default_deployment_enabled")]
    pub enabled: bool,
    /// Reference to the base artifact.
    pub base_content: Option<String>,
}

const fn default_deployment_enabled() -> bool {
    true
}

/// Type of redeploy executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorType {
    /// HTTP agent on each server.
    #[default]
    Http,

    /// In-process simulation for testing.
    Mock,
}

/// Redeploy executor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Type of executor to use.
    #[serde(default)]
    pub executor_type: ExecutorType,

    /// HTTP connect timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            executor_type: ExecutorType::default(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Redeploy behaviour configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedeployConfig {
    /// Default timeout for one redeploy command at one location, in seconds.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

const fn default_command_timeout_secs() -> u64 {
    120
}

impl RedeployConfig {
    /// The default per-command timeout.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for RedeployConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}
