//! Invalidation bus
//!
//! Applies realm cache invalidation events locally and publishes them to
//! the other nodes of the local site once the writing transaction succeeded.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::cluster::{ClusterEvent, ClusterProvider, DcNotify, InvalidationEvent, RealmCacheManager};
use crate::error::Result;

/// Channel carrying realm cache invalidations.
pub const REALM_INVALIDATION_EVENTS: &str = "REALM_INVALIDATION_EVENTS";

#[derive(Clone)]
pub struct InvalidationBus {
    realm_cache: Arc<RealmCacheManager>,
    cluster: Arc<dyn ClusterProvider>,
}

impl InvalidationBus {
    pub fn new(realm_cache: Arc<RealmCacheManager>, cluster: Arc<dyn ClusterProvider>) -> Self {
        Self { realm_cache, cluster }
    }

    /// Registers the receiving side on the invalidation channel.
    pub fn register(&self) {
        let bus = self.clone();
        self.cluster.register_listener(
            REALM_INVALIDATION_EVENTS,
            Arc::new(move |event: &ClusterEvent| {
                if let ClusterEvent::Invalidation(event) = event {
                    bus.on_receive(event);
                }
            }),
        );
    }

    pub fn realm_cache(&self) -> &Arc<RealmCacheManager> {
        &self.realm_cache
    }

    /// Evicts every key the event makes stale and returns the key set.
    ///
    /// Receiving the same event twice evicts nothing new.
    pub fn on_receive(&self, event: &InvalidationEvent) -> HashSet<String> {
        let invalidations = self.realm_cache.invalidations_for(event);
        debug!(
            node = %self.cluster.node_name(),
            event = %event,
            count = invalidations.len(),
            "invalidating realm cache items"
        );
        for key in &invalidations {
            self.realm_cache.invalidate_object(key);
        }
        invalidations
    }

    fn publish(&self, event: &InvalidationEvent) -> Result<()> {
        self.cluster.notify(
            REALM_INVALIDATION_EVENTS,
            &ClusterEvent::Invalidation(event.clone()),
            true,
            DcNotify::LocalDcOnly,
        )
    }

    pub fn transaction(&self) -> InvalidationTransaction {
        InvalidationTransaction {
            bus: self.clone(),
            events: Vec::new(),
        }
    }
}

// == Invalidation Transaction ==
/// Invalidations queued by one request.
pub struct InvalidationTransaction {
    bus: InvalidationBus,
    events: Vec<InvalidationEvent>,
}

impl InvalidationTransaction {
    pub fn add(&mut self, event: InvalidationEvent) {
        self.events.push(event);
    }

    pub fn pending(&self) -> &[InvalidationEvent] {
        &self.events
    }

    /// Applies queued events locally, then publishes them to other nodes.
    pub fn commit(self) -> Result<()> {
        for event in &self.events {
            self.bus.on_receive(event);
        }
        for event in &self.events {
            self.bus.publish(event)?;
        }
        Ok(())
    }

    /// Drops queued events; nothing was applied or sent.
    pub fn rollback(self) {
        debug!(count = self.events.len(), "discarding invalidation events");
    }
}
