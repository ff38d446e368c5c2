//! Cluster provider
//!
//! Named-channel messaging between nodes. Events always travel encoded, so
//! every receiver goes through the versioned decoder, including receivers in
//! the same process.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, error, trace};

use crate::cluster::wire::{WireReader, WireWriter};
use crate::cluster::{InvalidationEvent, SessionClusterEvent};
use crate::error::{Result, WireError};

/// Which datacenters receive a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DcNotify {
    LocalDcOnly,
    AllDcs,
    AllButLocalDc,
}

// == Cluster Event ==
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    Invalidation(InvalidationEvent),
    Session(SessionClusterEvent),
}

impl ClusterEvent {
    pub fn to_bytes(&self) -> Bytes {
        let mut writer = WireWriter::new();
        match self {
            ClusterEvent::Invalidation(event) => event.encode(&mut writer),
            ClusterEvent::Session(event) => event.encode(&mut writer),
        }
        writer.finish()
    }

    /// Decodes one event, dispatching on the leading type tag.
    pub fn decode(bytes: Bytes) -> std::result::Result<Self, WireError> {
        let tag = *bytes.first().ok_or(WireError::Truncated("type"))?;
        let mut reader = WireReader::new(bytes);
        if InvalidationEvent::is_tag(tag) {
            InvalidationEvent::decode(&mut reader).map(ClusterEvent::Invalidation)
        } else if SessionClusterEvent::is_tag(tag) {
            SessionClusterEvent::decode(&mut reader).map(ClusterEvent::Session)
        } else {
            Err(WireError::UnknownEventType(tag))
        }
    }
}

impl fmt::Display for ClusterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterEvent::Invalidation(event) => event.fmt(f),
            ClusterEvent::Session(event) => event.fmt(f),
        }
    }
}

// == Traits ==
pub trait ClusterListener: Send + Sync {
    fn event_received(&self, event: &ClusterEvent);
}

impl<F> ClusterListener for F
where
    F: Fn(&ClusterEvent) + Send + Sync,
{
    fn event_received(&self, event: &ClusterEvent) {
        self(event)
    }
}

/// Messaging between the nodes of the cluster.
pub trait ClusterProvider: Send + Sync {
    fn node_name(&self) -> &str;

    fn site_name(&self) -> Option<&str>;

    fn register_listener(&self, channel: &str, listener: Arc<dyn ClusterListener>);

    /// Sends an event on `channel`.
    ///
    /// # Arguments
    /// * `ignore_sender` - Skip the listeners of the sending node
    /// * `dc_notify` - Datacenters that receive the event
    fn notify(
        &self,
        channel: &str,
        event: &ClusterEvent,
        ignore_sender: bool,
        dc_notify: DcNotify,
    ) -> Result<()>;
}

// == In-Memory Cluster ==
struct NodeState {
    name: String,
    site: Option<String>,
    listeners: RwLock<HashMap<String, Vec<Arc<dyn ClusterListener>>>>,
}

impl NodeState {
    fn deliver(&self, channel: &str, payload: Bytes) -> std::result::Result<(), WireError> {
        let listeners = match self.listeners.read().get(channel) {
            Some(listeners) => listeners.clone(),
            None => return Ok(()),
        };

        let event = ClusterEvent::decode(payload)?;
        debug!(node = %self.name, channel, event = %event, "received cluster event");
        for listener in listeners {
            listener.event_received(&event);
        }
        Ok(())
    }
}

/// In-process hub connecting the nodes of one or more sites.
#[derive(Default)]
pub struct InMemoryCluster {
    nodes: RwLock<Vec<Arc<NodeState>>>,
}

impl InMemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a node to the hub.
    pub fn join(
        self: &Arc<Self>,
        node_name: impl Into<String>,
        site_name: Option<String>,
    ) -> Arc<ClusterNode> {
        let state = Arc::new(NodeState {
            name: node_name.into(),
            site: site_name,
            listeners: RwLock::new(HashMap::new()),
        });
        self.nodes.write().push(state.clone());
        Arc::new(ClusterNode {
            hub: self.clone(),
            state,
        })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }
}

/// One node's handle on the in-memory hub.
pub struct ClusterNode {
    hub: Arc<InMemoryCluster>,
    state: Arc<NodeState>,
}

impl ClusterNode {
    /// Feeds a raw payload to this node's listeners as if it came from the wire.
    pub fn deliver_raw(&self, channel: &str, payload: Bytes) -> Result<()> {
        self.state.deliver(channel, payload)?;
        Ok(())
    }

    fn receives(&self, target: &NodeState, ignore_sender: bool, dc_notify: DcNotify) -> bool {
        if ignore_sender && std::ptr::eq(self.state.as_ref(), target) {
            return false;
        }
        let same_site = target.site == self.state.site;
        match dc_notify {
            DcNotify::LocalDcOnly => same_site,
            DcNotify::AllDcs => true,
            DcNotify::AllButLocalDc => !same_site,
        }
    }
}

impl fmt::Debug for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterNode")
            .field("name", &self.state.name)
            .field("site", &self.state.site)
            .finish()
    }
}

impl ClusterProvider for ClusterNode {
    fn node_name(&self) -> &str {
        &self.state.name
    }

    fn site_name(&self) -> Option<&str> {
        self.state.site.as_deref()
    }

    fn register_listener(&self, channel: &str, listener: Arc<dyn ClusterListener>) {
        debug!(node = %self.state.name, channel, "registering cluster listener");
        self.state
            .listeners
            .write()
            .entry(channel.to_string())
            .or_default()
            .push(listener);
    }

    fn notify(
        &self,
        channel: &str,
        event: &ClusterEvent,
        ignore_sender: bool,
        dc_notify: DcNotify,
    ) -> Result<()> {
        let payload = event.to_bytes();
        let targets: Vec<Arc<NodeState>> = self.hub.nodes.read().clone();
        trace!(node = %self.state.name, channel, event = %event, ?dc_notify, "notifying cluster");

        for target in targets {
            if !self.receives(&target, ignore_sender, dc_notify) {
                continue;
            }
            if let Err(err) = target.deliver(channel, payload.clone()) {
                error!(
                    node = %target.name,
                    channel,
                    error = %err,
                    "dropping undecodable cluster event",
                );
            }
        }
        Ok(())
    }
}
