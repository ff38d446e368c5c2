//! Expiration Cleanup Task
//!
//! Background task that periodically purges expired sessions from every
//! region and from the persistent store.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::sessions::SessionCaches;

/// Spawns a background task that periodically removes expired sessions.
///
/// Regions also drop expired entries lazily on read; this task bounds how
/// long dead entries keep their memory.
///
/// # Arguments
/// * `caches` - Session caches of this node
/// * `cleanup_interval_secs` - Interval in seconds between cleanup runs
///
/// # Returns
/// A JoinHandle for the spawned task, used to abort it on shutdown.
pub fn spawn_cleanup_task(
    caches: Arc<SessionCaches>,
    cleanup_interval_secs: u64,
) -> JoinHandle<()> {
    let interval = Duration::from_secs(cleanup_interval_secs.max(1));

    tokio::spawn(async move {
        info!(
            interval_secs = cleanup_interval_secs,
            "Starting expired session cleanup task"
        );

        loop {
            tokio::time::sleep(interval).await;

            let removed = caches.remove_expired();
            if removed > 0 {
                info!(removed, "Expired session cleanup");
            } else {
                debug!("Expired session cleanup: nothing to remove");
            }
        }
    })
}
