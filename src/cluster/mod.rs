//! Cluster Module
//!
//! Messaging between nodes: realm cache invalidations, realm-wide session
//! events and the versioned wire format they travel in.

mod bus;
mod events;
mod provider;
mod realm_cache;
mod session_events;
pub mod wire;

pub use bus::{InvalidationBus, InvalidationTransaction, REALM_INVALIDATION_EVENTS};
pub use events::InvalidationEvent;
pub use provider::{
    ClusterEvent, ClusterListener, ClusterNode, ClusterProvider, DcNotify, InMemoryCluster,
};
pub use realm_cache::{CachedObject, QueryKind, RealmCacheManager};
pub use session_events::{
    SessionClusterEvent, SessionEventKind, AUTHENTICATION_SESSION_EVENTS,
    REALM_REMOVED_EVENT_AUTHSESSIONS, REALM_REMOVED_SESSION_EVENT, REMOVE_USER_SESSIONS_EVENT,
};
