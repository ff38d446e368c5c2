//! Session and realm models
//!
//! Entities stored in the session regions, plus the read-only realm, client
//! and user models supplied by the `ModelDirectory` collaborator.

pub mod auth_sessions;
pub mod realm;
pub mod sessions;

// Re-export commonly used types
pub use auth_sessions::{AuthenticationSessionEntity, RootAuthenticationSessionEntity};
pub use realm::{ClientModel, InMemoryDirectory, ModelDirectory, RealmModel, UserModel};
pub use sessions::{
    AuthenticatedClientSessionEntity, PersistenceState, SessionEntity, UserSessionEntity,
    UserSessionState, STARTED_AT_NOTE, USER_SESSION_REMEMBER_ME_NOTE, USER_SESSION_STARTED_AT_NOTE,
};
