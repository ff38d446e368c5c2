//! Sessions Module
//!
//! Node-wide session caches and the per-request providers built on them,
//! plus the key generator and persistent store collaborators.

mod auth_sessions;
mod factory;
mod keygen;
mod persister;
mod user_sessions;

pub use auth_sessions::AuthenticationSessionProvider;
pub use factory::{
    AuthSessionRegion, ClientSessionRegion, RemoteListener, SessionCaches, SessionCachesBuilder,
    UserSessionRegion, AUTHENTICATION_SESSIONS, CLIENT_SESSIONS, OFFLINE_CLIENT_SESSIONS,
    OFFLINE_USER_SESSIONS, USER_SESSIONS,
};
pub use keygen::{ClusterKeyGenerator, KeyGenerator};
pub use persister::{
    InMemoryUserSessionPersister, PersistentUserSession, SessionFilter, UserSessionPersister,
};
pub use user_sessions::{ClientSession, NewUserSession, UserSession, UserSessionProvider};
