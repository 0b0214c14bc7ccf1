//! Cirrus control service binary.
//!
//! Loads configuration, connects the metadata store, builds the backends
//! and keeps the control plane alive until a shutdown signal.

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cirrus_control::{ControlConfig, ControlPlane};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("cirrus_control=info".parse()?)
                .add_directive("cirrus_build=info".parse()?),
        )
        .init();

    info!("Cirrus control service starting");

    let config = ControlConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        let mut config = ControlConfig::default();
        config.align();
        config
    });

    info!(
        store = ?config.database.backend,
        storage = ?config.storage.storage_type,
        build = ?config.build.service_type,
        runtime = ?config.runtime.runtime_type,
        repository = %config.build.repository,
        network = %config.runtime.network,
        memory_mb = config.runtime.memory_mb,
        cpus = config.runtime.cpus,
        timeout_ms = config.runtime.timeout_ms,
        max_payload_bytes = config.dispatch.max_payload_bytes,
        max_concurrent_per_function = config.dispatch.max_concurrent_per_function,
        "configuration loaded"
    );

    let plane = ControlPlane::from_config(config).await?;
    info!(?plane, "control plane ready");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    Ok(())
}
