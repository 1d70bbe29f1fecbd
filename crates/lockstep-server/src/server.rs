//! Server lifecycle management.
//!
//! [`start_server`] opens the record store, binds the listener and serves
//! until the shutdown future resolves, then waits briefly for queued
//! records to reach disk.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::router::build_router;
use crate::state::AppState;
use crate::store::{EventStore, StoreError};

/// How long shutdown waits for the record writer to drain.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur when starting or running the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to the network address.
    #[error("bind error: {0}")]
    Bind(String),

    /// The server encountered a fatal error while serving.
    #[error("serve error: {0}")]
    Serve(String),

    /// The record store could not be opened.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Run the server until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the store cannot be opened, the address is invalid
/// or cannot be bound, or serving fails.
pub async fn start_server<F>(config: &ServerConfig, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = config
        .bind_address()
        .parse()
        .map_err(|e| ServerError::Bind(format!("invalid address: {e}")))?;

    let (store, writer) = EventStore::open(&config.data_dir, config.persist_queue).await?;
    info!(data_dir = %store.data_dir().display(), "record store opened");

    let state = Arc::new(AppState::new(store, config.broadcast_capacity));
    let router = build_router(Arc::clone(&state));

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::Bind(format!("bind failed on {addr}: {e}")))?;

    info!(%addr, "Lockstep server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ServerError::Serve(format!("serve error: {e}")))?;

    info!("shutting down, flushing records");
    drop(state);
    if tokio::time::timeout(FLUSH_TIMEOUT, writer).await.is_err() {
        warn!("record writer did not drain before timeout");
    }
    Ok(())
}

/// Resolve when the process receives Ctrl-C.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
