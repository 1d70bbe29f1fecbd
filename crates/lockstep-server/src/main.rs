//! Lockstep authority server binary.
//!
//! # Startup Sequence
//!
//! 1. Initialize structured logging (tracing)
//! 2. Load configuration (`LOCKSTEP_CONFIG` YAML plus env overrides)
//! 3. Serve until Ctrl-C, then flush the record store

use lockstep_server::{ServerConfig, shutdown_signal, start_server};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration is invalid or the server fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("lockstep-server starting");

    let config = ServerConfig::load()?;
    info!(
        host = config.host,
        port = config.port,
        data_dir = %config.data_dir.display(),
        broadcast_capacity = config.broadcast_capacity,
        "Configuration loaded"
    );

    start_server(&config, shutdown_signal()).await?;

    info!("lockstep-server stopped");
    Ok(())
}
