//! Service lifecycle management.
//!
//! Provides the main service runner with signal handling and graceful shutdown.

use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api;
use crate::config::{ControlConfig, StoreType, Transport};
use crate::content::ContentStore;
use crate::error::{OverlayError, OverlayResult};
use crate::executor::{create_executor, RedeployExecutor};
use crate::membership::{MembershipResolver, StaticMembership};
use crate::overlay::OverlayManager;
use crate::store::{MemoryStore, OverlayStore, PostgresStore};

/// The control service.
///
/// Manages the lifecycle of the control plane, including:
/// - Database connections
/// - The content store
/// - Server-group membership and the redeploy executor
/// - HTTP API server
/// - Signal handling and graceful shutdown
pub struct ControlService {
    config: ControlConfig,
    cancel: CancellationToken,
}

impl ControlService {
    /// Create a new control service with the given configuration.
    #[must_use]
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Run the control service.
    ///
    /// This will:
    /// 1. Connect to the database (or use in-memory store as fallback)
    /// 2. Open the content store and load the topology
    /// 3. Restore overlays and links into the overlay manager
    /// 4. Start the HTTP API server
    /// 5. Wait for shutdown signal
    pub async fn run(&self) -> OverlayResult<()> {
        let manager = Arc::new(self.build_manager().await?);

        let state = api::AppState {
            manager,
            max_body_bytes: self.config.server.max_body_bytes,
        };
        let app = api::router(state);

        info!(
            transport = %self.config.server.listen,
            "control service listening"
        );

        serve_transport(self.config.server.listen.clone(), app, self.cancel.clone()).await?;

        info!("control service shutdown complete");
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wire every component from configuration and restore persisted state.
    pub async fn build_manager(&self) -> OverlayResult<OverlayManager> {
        let store = self.create_store().await;

        let content = Arc::new(ContentStore::from_config(&self.config.content)?);
        info!(
            store_type = ?self.config.content.store_type,
            prefix = %self.config.content.prefix,
            "content store configured"
        );

        let resolver = self.create_resolver()?;
        let executor = self.create_executor()?;

        let manager = OverlayManager::open(
            store,
            content,
            resolver,
            executor,
            self.config.redeploy.command_timeout(),
        )
        .await?;

        let stats = manager.stats()?;
        info!(
            overlays = stats.overlays,
            links = stats.links,
            "overlay manager initialised"
        );
        Ok(manager)
    }

    async fn create_store(&self) -> Arc<dyn OverlayStore> {
        if self.config.database.store_type == StoreType::Memory {
            info!("using in-memory overlay store");
            return Arc::new(MemoryStore::new());
        }

        match PostgresStore::new(&self.config.database).await {
            Ok(store) => {
                info!(url = %self.config.database.url, "connected to PostgreSQL");
                Arc::new(store)
            }
            Err(e) => {
                error!(
                    error = %e,
                    "failed to connect to PostgreSQL, using in-memory store"
                );
                Arc::new(MemoryStore::new())
            }
        }
    }

    fn create_resolver(&self) -> OverlayResult<Arc<dyn MembershipResolver>> {
        let membership = StaticMembership::from_config(&self.config.topology)?;
        info!(groups = ?membership.groups(), "server-group topology loaded");
        Ok(Arc::new(membership))
    }

    fn create_executor(&self) -> OverlayResult<Arc<dyn RedeployExecutor>> {
        let executor = create_executor(&self.config.executor)?;
        info!(
            executor_type = ?self.config.executor.executor_type,
            "redeploy executor configured"
        );
        Ok(executor)
    }
}

/// Serve an axum router over the given transport with graceful shutdown.
async fn serve_transport(
    transport: Transport,
    app: axum::Router,
    cancel: CancellationToken,
) -> OverlayResult<()> {
    let cancel_clone = cancel.clone();
    match transport {
        Transport::Tcp { addr } => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|e| OverlayError::Config(format!("failed to bind TCP: {e}")))?;
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal(cancel_clone))
                .await
                .map_err(|e| OverlayError::Config(format!("server error: {e}")))?;
        }
        Transport::Unix { path } => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    OverlayError::Config(format!("failed to create socket dir: {e}"))
                })?;
            }
            if path.exists() {
                tokio::fs::remove_file(&path).await.map_err(|e| {
                    OverlayError::Config(format!("failed to remove stale socket: {e}"))
                })?;
            }
            let listener = tokio::net::UnixListener::bind(&path)
                .map_err(|e| OverlayError::Config(format!("failed to bind Unix socket: {e}")))?;
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal(cancel_clone))
                .await
                .map_err(|e| OverlayError::Config(format!("server error: {e}")))?;
        }
    }
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
        () = cancel.cancelled() => {
            info!("shutdown requested");
        }
    }
}
