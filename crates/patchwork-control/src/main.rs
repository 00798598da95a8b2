//! Patchwork control service binary.
//!
//! Runs the overlay control plane.

use tracing::info;
use tracing_subscriber::EnvFilter;

use patchwork_control::{ControlConfig, ControlService};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("patchwork_control=info".parse()?),
        )
        .init();

    info!("patchwork control service starting");

    let config = ControlConfig::load().unwrap_or_else(|e| {
        info!(error = %e, "failed to load config, using defaults");
        ControlConfig::default()
    });

    info!(
        listen = %config.server.listen,
        database = %config.database.url,
        groups = config.topology.groups.len(),
        "configuration loaded"
    );

    ControlService::new(config).run().await?;

    Ok(())
}
