//! Realm Session Cache - cluster-aware session and realm metadata cache
//!
//! Keeps user, client and authentication sessions in local regions with
//! changelog transactions, mirrors them to a cross-site remote store and
//! propagates realm cache invalidations between nodes.

pub mod cache;
pub mod changes;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod error;
pub mod models;
pub mod remote;
pub mod sessions;
pub mod tasks;

pub use config::Config;
pub use error::{CacheError, Result};
pub use sessions::{
    AuthenticationSessionProvider, NewUserSession, SessionCaches, SessionCachesBuilder,
    UserSessionProvider,
};
pub use tasks::{spawn_cleanup_task, spawn_remote_listeners};
