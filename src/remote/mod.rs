//! Remote Store Bridge
//!
//! Mirrors session regions to a cross-site remote store and applies the
//! remote store's change notifications back to the local regions.

mod invoker;
mod listener;
mod retry;
mod store;
mod topology;

pub use invoker::RemoteCacheInvoker;
pub use listener::{ListenerSettings, RemoteCacheSessionListener, RemoteEventHandler};
pub use retry::{Backoff, RetryExhausted, RetryPolicy};
pub use store::{
    InMemoryRemoteStore, RemoteCacheEvent, RemoteEventKind, RemoteStore, VersionedValue,
};
pub use topology::{LocalOwnership, PartitionOwnership, RendezvousOwnership, TopologyInfo};
