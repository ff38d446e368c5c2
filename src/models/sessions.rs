//! Session entities
//!
//! User sessions and client sessions reference each other by id only: a user
//! session lists its client sessions as `client id -> client session UUID`, and
//! a client session records the id of its user session.

use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::SessionEntityWrapper;

/// Client-session note holding the client session start time.
pub const STARTED_AT_NOTE: &str = "startedAt";
/// Client-session note holding the owning user session start time.
pub const USER_SESSION_STARTED_AT_NOTE: &str = "userSessionStartedAt";
/// Client-session note set when the owning user session is remember-me.
pub const USER_SESSION_REMEMBER_ME_NOTE: &str = "userSessionRememberMe";

// == Session Entity ==
/// Behaviour shared by everything stored in a session region.
pub trait SessionEntity: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn realm_id(&self) -> &str;

    /// Client whose settings drive this entity's expiration, if any.
    fn client_id(&self) -> Option<&str> {
        None
    }

    /// Combines an entity read from the remote store with the local copy.
    ///
    /// The remote content wins; node-local metadata of the local wrapper is kept.
    fn merge_remote(
        self,
        local: Option<&SessionEntityWrapper<Self>>,
    ) -> SessionEntityWrapper<Self> {
        match local {
            Some(local) => SessionEntityWrapper::with_local_metadata(
                self,
                local.local_metadata().clone(),
            ),
            None => SessionEntityWrapper::new(self),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UserSessionState {
    LoggedIn,
    LoggingOut,
    LoggedOut,
    LoggedOutUnconfirmed,
}

/// Whether a session is written to the cache at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PersistenceState {
    #[default]
    Persistent,
    /// Lives only for the current request
    Transient,
}

// == User Session ==
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSessionEntity {
    pub id: String,
    pub realm_id: String,
    pub user_id: String,
    pub login_username: Option<String>,
    pub ip_address: Option<String>,
    pub auth_method: Option<String>,
    pub remember_me: bool,
    pub broker_session_id: Option<String>,
    pub broker_user_id: Option<String>,
    /// Unix seconds
    pub started: i64,
    /// Unix seconds
    pub last_session_refresh: i64,
    pub state: Option<UserSessionState>,
    pub notes: HashMap<String, String>,
    /// client id -> client session id
    pub authenticated_client_sessions: HashMap<String, Uuid>,
}

impl UserSessionEntity {
    pub fn new(
        id: impl Into<String>,
        realm_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            realm_id: realm_id.into(),
            user_id: user_id.into(),
            login_username: None,
            ip_address: None,
            auth_method: None,
            remember_me: false,
            broker_session_id: None,
            broker_user_id: None,
            started: 0,
            last_session_refresh: 0,
            state: None,
            notes: HashMap::new(),
            authenticated_client_sessions: HashMap::new(),
        }
    }
}

impl SessionEntity for UserSessionEntity {
    fn realm_id(&self) -> &str {
        &self.realm_id
    }

    fn merge_remote(
        mut self,
        local: Option<&SessionEntityWrapper<Self>>,
    ) -> SessionEntityWrapper<Self> {
        let Some(local) = local else {
            return SessionEntityWrapper::new(self);
        };
        // A refresh seen only on this node must not move backwards
        self.last_session_refresh = self
            .last_session_refresh
            .max(local.entity().last_session_refresh);
        SessionEntityWrapper::with_local_metadata(self, local.local_metadata().clone())
    }
}

// == Client Session ==
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedClientSessionEntity {
    pub id: Uuid,
    pub realm_id: String,
    pub client_id: String,
    pub user_session_id: String,
    /// Unix seconds of the last refresh
    pub timestamp: i64,
    pub action: Option<String>,
    pub protocol: Option<String>,
    pub redirect_uri: Option<String>,
    pub notes: HashMap<String, String>,
}

impl AuthenticatedClientSessionEntity {
    pub fn new(
        id: Uuid,
        realm_id: impl Into<String>,
        client_id: impl Into<String>,
        user_session_id: impl Into<String>,
    ) -> Self {
        Self {
            id,
            realm_id: realm_id.into(),
            client_id: client_id.into(),
            user_session_id: user_session_id.into(),
            timestamp: 0,
            action: None,
            protocol: None,
            redirect_uri: None,
            notes: HashMap::new(),
        }
    }

    /// Start of the owning user session, falling back to this session's timestamp.
    pub fn user_session_started(&self) -> i64 {
        self.notes
            .get(USER_SESSION_STARTED_AT_NOTE)
            .and_then(|started| started.parse().ok())
            .unwrap_or(self.timestamp)
    }

    pub fn is_user_session_remember_me(&self) -> bool {
        self.notes
            .get(USER_SESSION_REMEMBER_ME_NOTE)
            .is_some_and(|value| value == "true")
    }
}

impl SessionEntity for AuthenticatedClientSessionEntity {
    fn realm_id(&self) -> &str {
        &self.realm_id
    }

    fn client_id(&self) -> Option<&str> {
        Some(&self.client_id)
    }

    fn merge_remote(
        mut self,
        local: Option<&SessionEntityWrapper<Self>>,
    ) -> SessionEntityWrapper<Self> {
        let Some(local) = local else {
            return SessionEntityWrapper::new(self);
        };
        self.timestamp = self.timestamp.max(local.entity().timestamp);
        SessionEntityWrapper::with_local_metadata(self, local.local_metadata().clone())
    }
}
