//! Remote Listener Task
//!
//! Drains the notifications of a remote store and hands each one to the
//! region's listener. Listeners block (store locks, backoff sleeps), so every
//! notification runs on the blocking pool; notifications of one region are
//! applied in arrival order.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{info, trace, warn};

use crate::remote::{RemoteCacheEvent, RemoteEventHandler};
use crate::sessions::SessionCaches;

/// Spawns the executor of one remote listener.
///
/// The task ends when the remote store drops its side of the channel.
pub fn spawn_remote_listener(
    handler: Arc<dyn RemoteEventHandler>,
    mut events: UnboundedReceiver<RemoteCacheEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(region = %handler.region_name(), "Starting remote store listener");

        while let Some(event) = events.recv().await {
            trace!(
                region = %handler.region_name(),
                key = %event.key,
                kind = ?event.kind,
                "Remote event received",
            );
            let worker = handler.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || worker.handle(&event)).await {
                warn!(region = %handler.region_name(), error = %e, "Remote event handler failed");
            }
        }

        info!(region = %handler.region_name(), "Remote store listener stopped");
    })
}

/// Spawns one executor per mirrored region of `caches`.
pub fn spawn_remote_listeners(caches: &SessionCaches) -> Vec<JoinHandle<()>> {
    caches
        .remote_listeners()
        .into_iter()
        .map(|(handler, events)| spawn_remote_listener(handler, events))
        .collect()
}
