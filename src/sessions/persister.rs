//! User session persister
//!
//! Durable store behind offline sessions. Offline sessions evicted from (or
//! never loaded into) the cache are recovered from here on lookup.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::changes::timeouts;
use crate::clock::Clock;
use crate::error::{CacheError, Result};
use crate::models::{AuthenticatedClientSessionEntity, RealmModel, UserSessionEntity};

/// A persisted user session with its client sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentUserSession {
    pub user_session: UserSessionEntity,
    pub client_sessions: Vec<AuthenticatedClientSessionEntity>,
}

/// Which sessions a bulk load returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFilter<'a> {
    User(&'a str),
    Client(&'a str),
}

// == Persister Trait ==
pub trait UserSessionPersister: Send + Sync {
    fn create_user_session(&self, session: &UserSessionEntity, offline: bool) -> Result<()>;

    fn create_client_session(
        &self,
        client_session: &AuthenticatedClientSessionEntity,
        offline: bool,
    ) -> Result<()>;

    fn remove_user_session(&self, user_session_id: &str, offline: bool) -> Result<()>;

    fn remove_client_session(
        &self,
        user_session_id: &str,
        client_id: &str,
        offline: bool,
    ) -> Result<()>;

    fn load_user_session(
        &self,
        realm: &RealmModel,
        user_session_id: &str,
        offline: bool,
    ) -> Result<Option<PersistentUserSession>>;

    /// Sessions matching `filter`, oldest refresh first.
    fn load_user_sessions(
        &self,
        realm: &RealmModel,
        filter: SessionFilter<'_>,
        offline: bool,
        first: usize,
        max: Option<usize>,
    ) -> Result<Vec<PersistentUserSession>>;

    fn load_client_session(
        &self,
        realm: &RealmModel,
        client_id: &str,
        user_session_id: &str,
        offline: bool,
    ) -> Result<Option<AuthenticatedClientSessionEntity>>;

    fn get_user_sessions_count(&self, offline: bool) -> Result<usize>;

    fn get_user_sessions_count_for_client(
        &self,
        realm: &RealmModel,
        client_id: &str,
        offline: bool,
    ) -> Result<usize>;

    /// client id -> number of sessions with a client session for it.
    fn get_user_sessions_count_by_clients(
        &self,
        realm: &RealmModel,
        offline: bool,
    ) -> Result<HashMap<String, usize>>;

    fn update_last_session_refreshes(
        &self,
        realm_id: &str,
        last_session_refresh: i64,
        user_session_ids: &[String],
        offline: bool,
    ) -> Result<()>;

    fn on_realm_removed(&self, realm_id: &str) -> Result<()>;

    fn on_user_removed(&self, realm_id: &str, user_id: &str) -> Result<()>;

    fn on_client_removed(&self, realm_id: &str, client_id: &str) -> Result<()>;

    /// Drops sessions past their realm timeouts; returns how many.
    fn remove_expired(&self, realm: &RealmModel) -> Result<usize>;
}

// == In-Memory Persister ==
#[derive(Debug, Clone)]
struct PersistedRow {
    user_session: UserSessionEntity,
    /// client id -> client session
    client_sessions: HashMap<String, AuthenticatedClientSessionEntity>,
}

impl PersistedRow {
    fn to_persistent(&self) -> PersistentUserSession {
        let mut user_session = self.user_session.clone();
        user_session.authenticated_client_sessions = self
            .client_sessions
            .iter()
            .map(|(client_id, client_session)| (client_id.clone(), client_session.id))
            .collect();
        PersistentUserSession {
            user_session,
            client_sessions: self.client_sessions.values().cloned().collect(),
        }
    }
}

type RowKey = (bool, String);

#[derive(Debug)]
pub struct InMemoryUserSessionPersister {
    rows: Mutex<HashMap<RowKey, PersistedRow>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryUserSessionPersister {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, realm: &RealmModel, row: &PersistedRow, offline: bool) -> bool {
        let now = self.clock.now_secs();
        let entity = &row.user_session;
        let (lifespan, max_idle) = if offline {
            (
                timeouts::offline_session_lifespan(realm, None, entity, now),
                timeouts::offline_session_max_idle(realm, None, entity, now),
            )
        } else {
            (
                timeouts::user_session_lifespan(realm, None, entity, now),
                timeouts::user_session_max_idle(realm, None, entity, now),
            )
        };
        lifespan.is_expired() || max_idle.is_expired()
    }
}

impl UserSessionPersister for InMemoryUserSessionPersister {
    fn create_user_session(&self, session: &UserSessionEntity, offline: bool) -> Result<()> {
        let mut user_session = session.clone();
        user_session.authenticated_client_sessions.clear();
        self.rows.lock().insert(
            (offline, session.id.clone()),
            PersistedRow {
                user_session,
                client_sessions: HashMap::new(),
            },
        );
        Ok(())
    }

    fn create_client_session(
        &self,
        client_session: &AuthenticatedClientSessionEntity,
        offline: bool,
    ) -> Result<()> {
        let mut rows = self.rows.lock();
        let row = rows
            .get_mut(&(offline, client_session.user_session_id.clone()))
            .ok_or_else(|| {
                CacheError::Persistence(format!(
                    "user session {} is not persisted",
                    client_session.user_session_id
                ))
            })?;
        row.client_sessions
            .insert(client_session.client_id.clone(), client_session.clone());
        Ok(())
    }

    fn remove_user_session(&self, user_session_id: &str, offline: bool) -> Result<()> {
        self.rows.lock().remove(&(offline, user_session_id.to_string()));
        Ok(())
    }

    fn remove_client_session(
        &self,
        user_session_id: &str,
        client_id: &str,
        offline: bool,
    ) -> Result<()> {
        if let Some(row) = self.rows.lock().get_mut(&(offline, user_session_id.to_string())) {
            row.client_sessions.remove(client_id);
        }
        Ok(())
    }

    fn load_user_session(
        &self,
        realm: &RealmModel,
        user_session_id: &str,
        offline: bool,
    ) -> Result<Option<PersistentUserSession>> {
        Ok(self
            .rows
            .lock()
            .get(&(offline, user_session_id.to_string()))
            .filter(|row| row.user_session.realm_id == realm.id)
            .map(PersistedRow::to_persistent))
    }

    fn load_user_sessions(
        &self,
        realm: &RealmModel,
        filter: SessionFilter<'_>,
        offline: bool,
        first: usize,
        max: Option<usize>,
    ) -> Result<Vec<PersistentUserSession>> {
        let rows = self.rows.lock();
        let mut matching: Vec<&PersistedRow> = rows
            .iter()
            .filter(|((row_offline, _), row)| {
                *row_offline == offline
                    && row.user_session.realm_id == realm.id
                    && match filter {
                        SessionFilter::User(user_id) => row.user_session.user_id == user_id,
                        SessionFilter::Client(client_id) => {
                            row.client_sessions.contains_key(client_id)
                        }
                    }
            })
            .map(|(_, row)| row)
            .collect();
        matching.sort_by(|a, b| {
            a.user_session
                .last_session_refresh
                .cmp(&b.user_session.last_session_refresh)
                .then_with(|| a.user_session.id.cmp(&b.user_session.id))
        });

        Ok(matching
            .into_iter()
            .skip(first)
            .take(max.unwrap_or(usize::MAX))
            .map(PersistedRow::to_persistent)
            .collect())
    }

    fn load_client_session(
        &self,
        realm: &RealmModel,
        client_id: &str,
        user_session_id: &str,
        offline: bool,
    ) -> Result<Option<AuthenticatedClientSessionEntity>> {
        Ok(self
            .rows
            .lock()
            .get(&(offline, user_session_id.to_string()))
            .filter(|row| row.user_session.realm_id == realm.id)
            .and_then(|row| row.client_sessions.get(client_id).cloned()))
    }

    fn get_user_sessions_count(&self, offline: bool) -> Result<usize> {
        Ok(self
            .rows
            .lock()
            .keys()
            .filter(|(row_offline, _)| *row_offline == offline)
            .count())
    }

    fn get_user_sessions_count_for_client(
        &self,
        realm: &RealmModel,
        client_id: &str,
        offline: bool,
    ) -> Result<usize> {
        Ok(self
            .rows
            .lock()
            .iter()
            .filter(|((row_offline, _), row)| {
                *row_offline == offline
                    && row.user_session.realm_id == realm.id
                    && row.client_sessions.contains_key(client_id)
            })
            .count())
    }

    fn get_user_sessions_count_by_clients(
        &self,
        realm: &RealmModel,
        offline: bool,
    ) -> Result<HashMap<String, usize>> {
        let mut counts = HashMap::new();
        for ((row_offline, _), row) in self.rows.lock().iter() {
            if *row_offline != offline || row.user_session.realm_id != realm.id {
                continue;
            }
            for client_id in row.client_sessions.keys() {
                *counts.entry(client_id.clone()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    fn update_last_session_refreshes(
        &self,
        realm_id: &str,
        last_session_refresh: i64,
        user_session_ids: &[String],
        offline: bool,
    ) -> Result<()> {
        let mut rows = self.rows.lock();
        for id in user_session_ids {
            if let Some(row) = rows.get_mut(&(offline, id.clone())) {
                if row.user_session.realm_id == realm_id {
                    row.user_session.last_session_refresh = last_session_refresh;
                }
            }
        }
        Ok(())
    }

    fn on_realm_removed(&self, realm_id: &str) -> Result<()> {
        self.rows
            .lock()
            .retain(|_, row| row.user_session.realm_id != realm_id);
        Ok(())
    }

    fn on_user_removed(&self, realm_id: &str, user_id: &str) -> Result<()> {
        self.rows.lock().retain(|_, row| {
            row.user_session.realm_id != realm_id || row.user_session.user_id != user_id
        });
        Ok(())
    }

    /// Drops the client's sessions, then user sessions left without any.
    fn on_client_removed(&self, realm_id: &str, client_id: &str) -> Result<()> {
        let mut rows = self.rows.lock();
        rows.retain(|_, row| {
            if row.user_session.realm_id != realm_id
                || row.client_sessions.remove(client_id).is_none()
            {
                return true;
            }
            !row.client_sessions.is_empty()
        });
        Ok(())
    }

    fn remove_expired(&self, realm: &RealmModel) -> Result<usize> {
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|(offline, _), row| {
            row.user_session.realm_id != realm.id || !self.is_expired(realm, row, *offline)
        });
        let removed = before - rows.len();
        if removed > 0 {
            debug!(realm = %realm.id, removed, "removed expired persistent sessions");
        }
        Ok(removed)
    }
}
