//! Realm Session Node
//!
//! Boots one cache node with in-memory collaborators: model directory,
//! persister, cluster hub and, when enabled, remote stores.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use realm_session_cache::clock::{Clock, SystemClock};
use realm_session_cache::models::InMemoryDirectory;
use realm_session_cache::remote::InMemoryRemoteStore;
use realm_session_cache::sessions::{
    AUTHENTICATION_SESSIONS, CLIENT_SESSIONS, OFFLINE_CLIENT_SESSIONS, OFFLINE_USER_SESSIONS,
    USER_SESSIONS,
};
use realm_session_cache::{spawn_cleanup_task, spawn_remote_listeners, Config, SessionCaches};

/// Main entry point for a session cache node.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Build the session caches
/// 4. Start the cleanup task and the remote store listeners
/// 5. Wait for SIGINT/SIGTERM, then stop the caches
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "realm_session_cache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting realm session cache node");

    let config = Config::from_env();
    info!(
        node = ?config.node_name,
        site = ?config.site_name,
        remote_store = config.remote_store_enabled,
        cleanup_interval = config.cleanup_interval,
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut builder = SessionCaches::builder(config.clone())
        .clock(clock.clone())
        .directory(Arc::new(InMemoryDirectory::new()));
    if config.remote_store_enabled {
        for region in [
            USER_SESSIONS,
            OFFLINE_USER_SESSIONS,
            CLIENT_SESSIONS,
            OFFLINE_CLIENT_SESSIONS,
            AUTHENTICATION_SESSIONS,
        ] {
            builder = builder.remote_store(
                region,
                Arc::new(InMemoryRemoteStore::new(region, clock.clone())),
            );
        }
    }
    let caches = builder.build().context("failed to build session caches")?;

    let cleanup_handle = spawn_cleanup_task(caches.clone(), config.cleanup_interval);
    let listener_handles = spawn_remote_listeners(&caches);
    info!(remote_listeners = listener_handles.len(), "Background tasks started");

    shutdown_signal().await?;

    cleanup_handle.abort();
    for handle in listener_handles {
        handle.abort();
    }
    caches.stop();
    warn!("Background tasks aborted");

    info!("Node shutdown complete");
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    #[cfg(unix)]
    tokio::select! {
        result = ctrl_c => {
            result.context("failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate.recv() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.context("failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, initiating shutdown...");
    }

    Ok(())
}
