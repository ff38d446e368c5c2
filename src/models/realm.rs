//! Realm, client and user models
//!
//! The cache layer only reads these. They come from the `ModelDirectory`
//! collaborator and carry the timeout policies used to compute entry TTLs.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Realm settings relevant to session expiration. All durations in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealmModel {
    pub id: String,
    pub name: String,
    pub sso_session_idle_timeout: i64,
    pub sso_session_max_lifespan: i64,
    /// 0 = same as the non remember-me value
    pub sso_session_idle_timeout_remember_me: i64,
    pub sso_session_max_lifespan_remember_me: i64,
    pub offline_session_idle_timeout: i64,
    pub offline_session_max_lifespan_enabled: bool,
    pub offline_session_max_lifespan: i64,
    /// 0 = inherit from the user session
    pub client_session_idle_timeout: i64,
    pub client_session_max_lifespan: i64,
    pub client_offline_session_idle_timeout: i64,
    pub client_offline_session_max_lifespan: i64,
    /// Lifespan of root authentication sessions
    pub access_code_lifespan_login: i64,
}

impl RealmModel {
    /// Realm with the stock timeout values.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            sso_session_idle_timeout: 1800,
            sso_session_max_lifespan: 36_000,
            sso_session_idle_timeout_remember_me: 0,
            sso_session_max_lifespan_remember_me: 0,
            offline_session_idle_timeout: 2_592_000,
            offline_session_max_lifespan_enabled: false,
            offline_session_max_lifespan: 5_184_000,
            client_session_idle_timeout: 0,
            client_session_max_lifespan: 0,
            client_offline_session_idle_timeout: 0,
            client_offline_session_max_lifespan: 0,
            access_code_lifespan_login: 1800,
        }
    }
}

/// Client with optional per-client session timeout overrides (seconds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientModel {
    /// Internal id, the key used by session entities
    pub id: String,
    /// Human-facing client identifier
    pub client_id: String,
    pub realm_id: String,
    pub client_session_idle_timeout: Option<i64>,
    pub client_session_max_lifespan: Option<i64>,
    pub client_offline_session_idle_timeout: Option<i64>,
    pub client_offline_session_max_lifespan: Option<i64>,
}

impl ClientModel {
    pub fn new(
        id: impl Into<String>,
        client_id: impl Into<String>,
        realm_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            client_id: client_id.into(),
            realm_id: realm_id.into(),
            client_session_idle_timeout: None,
            client_session_max_lifespan: None,
            client_offline_session_idle_timeout: None,
            client_offline_session_max_lifespan: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserModel {
    pub id: String,
    pub realm_id: String,
    pub username: String,
}

impl UserModel {
    pub fn new(
        id: impl Into<String>,
        realm_id: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            realm_id: realm_id.into(),
            username: username.into(),
        }
    }
}

// == Model Directory ==
/// Read access to realms, clients and users owned by other subsystems.
pub trait ModelDirectory: Send + Sync {
    fn realm(&self, realm_id: &str) -> Option<RealmModel>;

    fn realms(&self) -> Vec<RealmModel>;

    fn client(&self, realm_id: &str, client_id: &str) -> Option<ClientModel>;

    fn user(&self, realm_id: &str, user_id: &str) -> Option<UserModel>;

    fn user_exists(&self, realm_id: &str, user_id: &str) -> bool {
        self.user(realm_id, user_id).is_some()
    }
}

/// Directory kept in memory. Used by the demo node and tests.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    realms: RwLock<HashMap<String, RealmModel>>,
    clients: RwLock<HashMap<(String, String), ClientModel>>,
    users: RwLock<HashMap<(String, String), UserModel>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_realm(&self, realm: RealmModel) {
        self.realms.write().insert(realm.id.clone(), realm);
    }

    /// Removes the realm together with its clients and users.
    pub fn remove_realm(&self, realm_id: &str) {
        self.realms.write().remove(realm_id);
        self.clients.write().retain(|(realm, _), _| realm != realm_id);
        self.users.write().retain(|(realm, _), _| realm != realm_id);
    }

    pub fn add_client(&self, client: ClientModel) {
        self.clients
            .write()
            .insert((client.realm_id.clone(), client.id.clone()), client);
    }

    pub fn add_user(&self, user: UserModel) {
        self.users
            .write()
            .insert((user.realm_id.clone(), user.id.clone()), user);
    }

    pub fn remove_user(&self, realm_id: &str, user_id: &str) {
        self.users
            .write()
            .remove(&(realm_id.to_string(), user_id.to_string()));
    }
}

impl ModelDirectory for InMemoryDirectory {
    fn realm(&self, realm_id: &str) -> Option<RealmModel> {
        self.realms.read().get(realm_id).cloned()
    }

    fn realms(&self) -> Vec<RealmModel> {
        self.realms.read().values().cloned().collect()
    }

    fn client(&self, realm_id: &str, client_id: &str) -> Option<ClientModel> {
        self.clients
            .read()
            .get(&(realm_id.to_string(), client_id.to_string()))
            .cloned()
    }

    fn user(&self, realm_id: &str, user_id: &str) -> Option<UserModel> {
        self.users
            .read()
            .get(&(realm_id.to_string(), user_id.to_string()))
            .cloned()
    }
}
