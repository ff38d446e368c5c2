//! User session provider
//!
//! Per-request facade over the user and client session regions. Reads go
//! through the request's changelog transactions so a request always sees its
//! own writes; nothing reaches the regions, the remote store or the other
//! nodes before `commit`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::cache::SessionEntityWrapper;
use crate::changes::{ChangelogTransaction, CrossDcMessageStatus, SessionUpdateTask};
use crate::cluster::{
    ClusterEvent, DcNotify, SessionClusterEvent, SessionEventKind, REALM_REMOVED_SESSION_EVENT,
    REMOVE_USER_SESSIONS_EVENT,
};
use crate::error::Result;
use crate::models::{
    AuthenticatedClientSessionEntity, ClientModel, PersistenceState, RealmModel, SessionEntity,
    UserSessionEntity, UserSessionState, STARTED_AT_NOTE, USER_SESSION_REMEMBER_ME_NOTE,
    USER_SESSION_STARTED_AT_NOTE,
};
use crate::sessions::{PersistentUserSession, SessionCaches, SessionFilter};

// == Views ==
/// Snapshot of a user session as seen by the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSession {
    entity: UserSessionEntity,
    offline: bool,
    persistence: PersistenceState,
}

impl UserSession {
    pub fn id(&self) -> &str {
        &self.entity.id
    }

    pub fn realm_id(&self) -> &str {
        &self.entity.realm_id
    }

    pub fn user_id(&self) -> &str {
        &self.entity.user_id
    }

    pub fn started(&self) -> i64 {
        self.entity.started
    }

    pub fn last_session_refresh(&self) -> i64 {
        self.entity.last_session_refresh
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    pub fn is_remember_me(&self) -> bool {
        self.entity.remember_me
    }

    pub fn note(&self, name: &str) -> Option<&str> {
        self.entity.notes.get(name).map(String::as_str)
    }

    /// Id of the client session registered for `client_id`.
    pub fn client_session_id(&self, client_id: &str) -> Option<Uuid> {
        self.entity.authenticated_client_sessions.get(client_id).copied()
    }

    pub fn client_session_ids(&self) -> &HashMap<String, Uuid> {
        &self.entity.authenticated_client_sessions
    }

    pub fn persistence_state(&self) -> PersistenceState {
        self.persistence
    }

    pub fn entity(&self) -> &UserSessionEntity {
        &self.entity
    }
}

/// Snapshot of a client session as seen by the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSession {
    entity: AuthenticatedClientSessionEntity,
    offline: bool,
}

impl ClientSession {
    pub fn id(&self) -> Uuid {
        self.entity.id
    }

    pub fn client_id(&self) -> &str {
        &self.entity.client_id
    }

    pub fn user_session_id(&self) -> &str {
        &self.entity.user_session_id
    }

    pub fn timestamp(&self) -> i64 {
        self.entity.timestamp
    }

    pub fn note(&self, name: &str) -> Option<&str> {
        self.entity.notes.get(name).map(String::as_str)
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    pub fn entity(&self) -> &AuthenticatedClientSessionEntity {
        &self.entity
    }
}

/// Input of `create_user_session`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUserSession {
    /// Generated when absent
    pub id: Option<String>,
    pub realm_id: String,
    pub user_id: String,
    pub login_username: Option<String>,
    pub ip_address: Option<String>,
    pub auth_method: Option<String>,
    pub remember_me: bool,
    pub broker_session_id: Option<String>,
    pub broker_user_id: Option<String>,
    pub persistence: PersistenceState,
}

impl NewUserSession {
    pub fn new(
        realm_id: impl Into<String>,
        user_id: impl Into<String>,
        login_username: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            realm_id: realm_id.into(),
            user_id: user_id.into(),
            login_username: Some(login_username.into()),
            ip_address: None,
            auth_method: None,
            remember_me: false,
            broker_session_id: None,
            broker_user_id: None,
            persistence: PersistenceState::Persistent,
        }
    }
}

type UserSessionTx = ChangelogTransaction<String, UserSessionEntity>;
type ClientSessionTx = ChangelogTransaction<Uuid, AuthenticatedClientSessionEntity>;

// == User Session Provider ==
pub struct UserSessionProvider {
    caches: Arc<SessionCaches>,
    sessions_tx: UserSessionTx,
    offline_sessions_tx: UserSessionTx,
    client_sessions_tx: ClientSessionTx,
    offline_client_sessions_tx: ClientSessionTx,
    /// Ids of sessions created transient in this request
    transient: HashSet<String>,
    cluster_events: Vec<(&'static str, SessionClusterEvent, DcNotify)>,
}

impl UserSessionProvider {
    pub fn new(caches: Arc<SessionCaches>) -> Self {
        let retries = caches.config().replace_retries;
        Self {
            sessions_tx: ChangelogTransaction::new(caches.user_sessions(false).clone(), retries),
            offline_sessions_tx: ChangelogTransaction::new(
                caches.user_sessions(true).clone(),
                retries,
            ),
            client_sessions_tx: ChangelogTransaction::new(
                caches.client_sessions(false).clone(),
                retries,
            ),
            offline_client_sessions_tx: ChangelogTransaction::new(
                caches.client_sessions(true).clone(),
                retries,
            ),
            transient: HashSet::new(),
            cluster_events: Vec::new(),
            caches,
        }
    }

    fn now(&self) -> i64 {
        self.caches.clock().now_secs()
    }

    fn session_tx(&mut self, offline: bool) -> &mut UserSessionTx {
        if offline {
            &mut self.offline_sessions_tx
        } else {
            &mut self.sessions_tx
        }
    }

    fn client_tx(&mut self, offline: bool) -> &mut ClientSessionTx {
        if offline {
            &mut self.offline_client_sessions_tx
        } else {
            &mut self.client_sessions_tx
        }
    }

    fn view(&self, entity: UserSessionEntity, offline: bool) -> UserSession {
        let persistence = if self.transient.contains(&entity.id) {
            PersistenceState::Transient
        } else {
            PersistenceState::Persistent
        };
        UserSession {
            entity,
            offline,
            persistence,
        }
    }

    // == Create ==
    pub fn create_user_session(&mut self, new: NewUserSession) -> Result<UserSession> {
        let id = new
            .id
            .unwrap_or_else(|| self.caches.keygen().generate_key_string());
        let now = self.now();

        let mut entity = UserSessionEntity::new(id.clone(), new.realm_id, new.user_id);
        entity.login_username = new.login_username;
        entity.ip_address = new.ip_address;
        entity.auth_method = new.auth_method;
        entity.remember_me = new.remember_me;
        entity.broker_session_id = new.broker_session_id;
        entity.broker_user_id = new.broker_user_id;
        entity.started = now;
        entity.last_session_refresh = now;
        entity.state = Some(UserSessionState::LoggedIn);

        if new.persistence == PersistenceState::Transient {
            self.transient.insert(id.clone());
        }
        self.sessions_tx.add_task_with_entity(
            id,
            SessionUpdateTask::add_if_absent(),
            entity.clone(),
            new.persistence,
        )?;

        trace!(session = %entity.id, realm = %entity.realm_id, "Created user session");
        Ok(self.view(entity, false))
    }

    /// Creates a client session and registers it on its user session,
    /// replacing any previous client session of the same client.
    pub fn create_client_session(
        &mut self,
        realm: &RealmModel,
        client: &ClientModel,
        user_session: &UserSession,
    ) -> Result<ClientSession> {
        let offline = user_session.is_offline();
        let id = self.caches.keygen().generate_key_uuid();
        let now = self.now();

        let mut entity = AuthenticatedClientSessionEntity::new(
            id,
            realm.id.clone(),
            client.id.clone(),
            user_session.id(),
        );
        entity.timestamp = now;
        entity.notes.insert(STARTED_AT_NOTE.to_string(), now.to_string());
        entity
            .notes
            .insert(USER_SESSION_STARTED_AT_NOTE.to_string(), user_session.started().to_string());
        if user_session.is_remember_me() {
            entity
                .notes
                .insert(USER_SESSION_REMEMBER_ME_NOTE.to_string(), "true".to_string());
        }

        self.client_tx(offline).add_task_with_entity(
            id,
            SessionUpdateTask::add_if_absent(),
            entity.clone(),
            user_session.persistence_state(),
        )?;
        self.register_client_session(user_session.id(), &client.id, id, offline)?;

        Ok(ClientSession { entity, offline })
    }

    fn register_client_session(
        &mut self,
        user_session_id: &str,
        client_id: &str,
        client_session_id: Uuid,
        offline: bool,
    ) -> Result<()> {
        let key = user_session_id.to_string();
        let previous = self
            .session_tx(offline)
            .get(&key)
            .and_then(|wrapper| {
                wrapper
                    .entity()
                    .authenticated_client_sessions
                    .get(client_id)
                    .copied()
            });
        if let Some(previous) = previous.filter(|previous| *previous != client_session_id) {
            debug!(session = %user_session_id, client = %client_id, "Replacing client session");
            self.client_tx(offline).add_task(previous, SessionUpdateTask::remove())?;
        }

        let client_id = client_id.to_string();
        self.session_tx(offline).add_task(
            key,
            SessionUpdateTask::replace(move |session: &mut UserSessionEntity| {
                session
                    .authenticated_client_sessions
                    .insert(client_id.clone(), client_session_id);
            }),
        )
    }

    // == Lookup ==
    pub fn get_user_session(&mut self, realm: &RealmModel, id: &str) -> Option<UserSession> {
        self.load_user_session(realm, id, false)
    }

    /// Offline sessions missing from memory are recovered from the persister.
    pub fn get_offline_user_session(
        &mut self,
        realm: &RealmModel,
        id: &str,
    ) -> Option<UserSession> {
        self.load_user_session(realm, id, true)
    }

    fn load_user_session(
        &mut self,
        realm: &RealmModel,
        id: &str,
        offline: bool,
    ) -> Option<UserSession> {
        let key = id.to_string();
        let wrapper = match self.session_tx(offline).get(&key) {
            Some(wrapper) => wrapper,
            None if offline => self.recover_offline_user_session(realm, id)?,
            None => return None,
        };

        let entity = wrapper.into_entity();
        if entity.realm_id != realm.id {
            return None;
        }
        self.check_user(entity, offline)
    }

    fn recover_offline_user_session(
        &mut self,
        realm: &RealmModel,
        id: &str,
    ) -> Option<SessionEntityWrapper<UserSessionEntity>> {
        let persistent = match self.caches.persister().load_user_session(realm, id, true) {
            Ok(Some(persistent)) => persistent,
            Ok(None) => return None,
            Err(e) => {
                warn!(session = %id, error = %e, "Failed to load offline session from persister");
                return None;
            }
        };

        debug!(session = %id, "Offline session not in memory, importing it from persister");
        match self.caches.import_persistent_session(persistent, true) {
            Ok(true) => self.offline_sessions_tx.get(&id.to_string()),
            Ok(false) => {
                debug!(session = %id, "Persisted offline session already expired, removing it");
                if let Err(e) = self.caches.persister().remove_user_session(id, true) {
                    warn!(session = %id, error = %e, "Failed to remove expired offline session");
                }
                None
            }
            Err(e) => {
                warn!(session = %id, error = %e, "Failed to import offline session");
                None
            }
        }
    }

    /// Sessions of users that no longer exist are removed on sight.
    fn check_user(&mut self, entity: UserSessionEntity, offline: bool) -> Option<UserSession> {
        if self
            .caches
            .directory()
            .user_exists(&entity.realm_id, &entity.user_id)
        {
            return Some(self.view(entity, offline));
        }

        debug!(
            session = %entity.id,
            user = %entity.user_id,
            "User of session no longer exists, removing session",
        );
        if let Err(e) = self.remove_cascade(&entity, offline) {
            warn!(session = %entity.id, error = %e, "Failed to remove orphaned session");
        }
        if offline {
            if let Err(e) = self.caches.persister().remove_user_session(&entity.id, true) {
                warn!(
                    session = %entity.id,
                    error = %e,
                    "Failed to remove orphaned offline session",
                );
            }
        }
        None
    }

    pub fn get_client_session(
        &mut self,
        user_session: &UserSession,
        client_id: &str,
        client_session_id: Uuid,
        offline: bool,
    ) -> Option<ClientSession> {
        let wrapper = match self.client_tx(offline).get(&client_session_id) {
            Some(wrapper) => wrapper,
            None if offline => self.recover_offline_client_session(user_session, client_id)?,
            None => return None,
        };

        let entity = wrapper.into_entity();
        if entity.user_session_id != user_session.id() {
            return None;
        }
        Some(ClientSession { entity, offline })
    }

    fn recover_offline_client_session(
        &mut self,
        user_session: &UserSession,
        client_id: &str,
    ) -> Option<SessionEntityWrapper<AuthenticatedClientSessionEntity>> {
        let realm = self.caches.directory().realm(user_session.realm_id())?;
        let persister = self.caches.persister().clone();

        let mut client_session = match persister.load_client_session(
            &realm,
            client_id,
            user_session.id(),
            true,
        ) {
            Ok(Some(client_session)) => client_session,
            Ok(None) => return None,
            Err(e) => {
                warn!(
                    session = %user_session.id(),
                    client = %client_id,
                    error = %e,
                    "Failed to load offline client session",
                );
                return None;
            }
        };
        client_session.timestamp = user_session.last_session_refresh();

        let region = self.caches.client_sessions(true);
        match SessionCaches::import_entity(region, client_session.id, &client_session) {
            Ok(true) => self.offline_client_sessions_tx.get(&client_session.id),
            Ok(false) => {
                debug!(
                    session = %user_session.id(),
                    client = %client_id,
                    "Persisted offline client session expired, removing it",
                );
                if let Err(e) = persister.remove_client_session(
                    user_session.id(),
                    client_id,
                    true,
                ) {
                    warn!(
                        session = %user_session.id(),
                        error = %e,
                        "Failed to remove expired offline client session",
                    );
                }
                None
            }
            Err(e) => {
                warn!(
                    session = %user_session.id(),
                    error = %e,
                    "Failed to import offline client session",
                );
                None
            }
        }
    }

    /// Looks the session up locally, then in the remote store; a remote hit
    /// matching the predicate refreshes the local copy.
    pub fn get_user_session_with_predicate<P>(
        &mut self,
        realm: &RealmModel,
        id: &str,
        offline: bool,
        predicate: P,
    ) -> Result<Option<UserSession>>
    where
        P: Fn(&UserSessionEntity) -> bool,
    {
        if let Some(session) = self.load_user_session(realm, id, offline) {
            if predicate(session.entity()) {
                return Ok(Some(session));
            }
        }

        let region = self.caches.user_sessions(offline).clone();
        let Some(invoker) = region.remote() else {
            return Ok(None);
        };
        let Some((remote, _version)) = invoker.get::<UserSessionEntity>(id)? else {
            debug!(session = %id, "Session not found in remote store");
            return Ok(None);
        };
        if remote.realm_id != realm.id || !predicate(&remote) {
            return Ok(None);
        }

        debug!(session = %id, "Session found in remote store, refreshing local copy");
        let key = id.to_string();
        let merged = remote.merge_remote(region.store().peek(&key).as_ref());
        let expiration = region.expiration_for(merged.entity());
        let Some(stored) = region.store().put(key.clone(), merged, expiration) else {
            return Ok(None);
        };
        self.session_tx(offline).reload_entity(key, stored.clone());
        Ok(self.check_user(stored.into_entity(), offline))
    }

    // == Updates ==
    pub fn update_user_session(
        &mut self,
        session: &UserSession,
        task: SessionUpdateTask<UserSessionEntity>,
    ) -> Result<()> {
        self.session_tx(session.is_offline())
            .add_task(session.id().to_string(), task)
    }

    pub fn set_user_session_note(
        &mut self,
        session: &UserSession,
        name: &str,
        value: &str,
    ) -> Result<()> {
        let (name, value) = (name.to_string(), value.to_string());
        self.update_user_session(
            session,
            SessionUpdateTask::replace(move |entity: &mut UserSessionEntity| {
                entity.notes.insert(name.clone(), value.clone());
            }),
        )
    }

    pub fn remove_user_session_note(&mut self, session: &UserSession, name: &str) -> Result<()> {
        let name = name.to_string();
        self.update_user_session(
            session,
            SessionUpdateTask::replace(move |entity: &mut UserSessionEntity| {
                entity.notes.remove(&name);
            }),
        )
    }

    /// Moves the last refresh forward. Replicated asynchronously; offline
    /// sessions also update the persister.
    pub fn refresh_user_session(&mut self, session: &UserSession, timestamp: i64) -> Result<()> {
        self.update_user_session(
            session,
            SessionUpdateTask::replace(move |entity: &mut UserSessionEntity| {
                entity.last_session_refresh = entity.last_session_refresh.max(timestamp);
            })
            .with_cross_dc(CrossDcMessageStatus::Async),
        )?;
        if session.is_offline() {
            self.caches.persister().update_last_session_refreshes(
                session.realm_id(),
                timestamp,
                &[session.id().to_string()],
                true,
            )?;
        }
        Ok(())
    }

    pub fn update_client_session(
        &mut self,
        client_session: &ClientSession,
        task: SessionUpdateTask<AuthenticatedClientSessionEntity>,
    ) -> Result<()> {
        self.client_tx(client_session.is_offline())
            .add_task(client_session.id(), task)
    }

    pub fn refresh_client_session(
        &mut self,
        client_session: &ClientSession,
        timestamp: i64,
    ) -> Result<()> {
        self.update_client_session(
            client_session,
            SessionUpdateTask::replace(move |entity: &mut AuthenticatedClientSessionEntity| {
                entity.timestamp = entity.timestamp.max(timestamp);
            })
            .with_cross_dc(CrossDcMessageStatus::Async),
        )
    }

    // == Removal ==
    pub fn remove_user_session(&mut self, realm: &RealmModel, session: &UserSession) -> Result<()> {
        if session.realm_id() != realm.id {
            return Ok(());
        }
        let current = self.current_entity(session);
        self.remove_cascade(&current, session.is_offline())
    }

    /// Latest pending view of the session, so client sessions created in
    /// this request are removed as well.
    fn current_entity(&mut self, session: &UserSession) -> UserSessionEntity {
        self.session_tx(session.is_offline())
            .get(&session.id().to_string())
            .map(SessionEntityWrapper::into_entity)
            .unwrap_or_else(|| session.entity().clone())
    }

    fn remove_cascade(&mut self, entity: &UserSessionEntity, offline: bool) -> Result<()> {
        for client_session_id in entity.authenticated_client_sessions.values() {
            self.client_tx(offline)
                .add_task(*client_session_id, SessionUpdateTask::remove())?;
        }
        self.session_tx(offline)
            .add_task(entity.id.clone(), SessionUpdateTask::remove())
    }

    /// Removes every online session of the user.
    pub fn remove_user_sessions(&mut self, realm: &RealmModel, user_id: &str) -> Result<()> {
        self.remove_sessions_of_user(realm, user_id, false)
    }

    fn remove_sessions_of_user(
        &mut self,
        realm: &RealmModel,
        user_id: &str,
        offline: bool,
    ) -> Result<()> {
        let sessions = self
            .caches
            .user_sessions(offline)
            .store()
            .values_where(|session| session.realm_id == realm.id && session.user_id == user_id);
        for session in sessions {
            self.remove_cascade(session.entity(), offline)?;
        }
        Ok(())
    }

    /// Removes the online sessions of the realm on every node after commit.
    pub fn remove_all_user_sessions(&mut self, realm: &RealmModel) {
        self.queue_event(
            REMOVE_USER_SESSIONS_EVENT,
            SessionEventKind::RemoveUserSessions,
            &realm.id,
        );
    }

    pub fn remove_local_user_sessions(&self, realm_id: &str, offline: bool) -> usize {
        self.caches.remove_local_user_sessions(realm_id, offline)
    }

    fn queue_event(&mut self, channel: &'static str, kind: SessionEventKind, realm_id: &str) {
        let topology = self.caches.topology();
        let event = SessionClusterEvent::new(
            kind,
            realm_id,
            Some(topology.node_name().to_string()),
            topology.site_name().map(str::to_string),
        );
        self.cluster_events.push((channel, event, DcNotify::LocalDcOnly));
    }

    // == Model Events ==
    pub fn on_realm_removed(&mut self, realm_id: &str) -> Result<()> {
        self.queue_event(REALM_REMOVED_SESSION_EVENT, SessionEventKind::RealmRemoved, realm_id);
        self.caches.persister().on_realm_removed(realm_id)
    }

    /// Drops the user's online and offline sessions with their client sessions.
    pub fn on_user_removed(&mut self, realm: &RealmModel, user_id: &str) -> Result<()> {
        self.remove_sessions_of_user(realm, user_id, true)?;
        self.remove_sessions_of_user(realm, user_id, false)?;
        self.caches.persister().on_user_removed(&realm.id, user_id)
    }

    pub fn on_client_removed(&mut self, realm: &RealmModel, client_id: &str) -> Result<()> {
        self.caches.persister().on_client_removed(&realm.id, client_id)
    }

    // == Queries ==
    /// Live online sessions matching the predicate, oldest refresh first.
    fn query_sessions<F>(&self, predicate: F, first: usize, max: Option<usize>) -> Vec<UserSession>
    where
        F: Fn(&UserSessionEntity) -> bool,
    {
        let mut sessions: Vec<UserSessionEntity> = self
            .caches
            .user_sessions(false)
            .store()
            .values_where(predicate)
            .into_iter()
            .map(SessionEntityWrapper::into_entity)
            .collect();
        sessions.sort_by(|a, b| {
            a.last_session_refresh
                .cmp(&b.last_session_refresh)
                .then_with(|| a.id.cmp(&b.id))
        });
        sessions
            .into_iter()
            .skip(first)
            .take(max.unwrap_or(usize::MAX))
            .map(|entity| self.view(entity, false))
            .collect()
    }

    pub fn get_user_sessions_for_user(
        &self,
        realm: &RealmModel,
        user_id: &str,
        first: usize,
        max: Option<usize>,
    ) -> Vec<UserSession> {
        self.query_sessions(
            |session| session.realm_id == realm.id && session.user_id == user_id,
            first,
            max,
        )
    }

    pub fn get_user_sessions_for_client(
        &self,
        realm: &RealmModel,
        client_id: &str,
        first: usize,
        max: Option<usize>,
    ) -> Vec<UserSession> {
        self.query_sessions(
            |session| {
                session.realm_id == realm.id
                    && session.authenticated_client_sessions.contains_key(client_id)
            },
            first,
            max,
        )
    }

    pub fn get_user_session_by_broker_session_id(
        &self,
        realm: &RealmModel,
        broker_session_id: &str,
    ) -> Option<UserSession> {
        self.query_sessions(
            |session| {
                session.realm_id == realm.id
                    && session.broker_session_id.as_deref() == Some(broker_session_id)
            },
            0,
            Some(1),
        )
        .into_iter()
        .next()
    }

    pub fn get_user_sessions_by_broker_user_id(
        &self,
        realm: &RealmModel,
        broker_user_id: &str,
    ) -> Vec<UserSession> {
        self.query_sessions(
            |session| {
                session.realm_id == realm.id
                    && session.broker_user_id.as_deref() == Some(broker_user_id)
            },
            0,
            None,
        )
    }

    /// Online sessions of the realm that have a client session for `client_id`.
    pub fn get_active_user_sessions_count(&self, realm: &RealmModel, client_id: &str) -> usize {
        self.caches
            .user_sessions(false)
            .store()
            .values_where(|session| {
                session.realm_id == realm.id
                    && session.authenticated_client_sessions.contains_key(client_id)
            })
            .len()
    }

    /// client id -> number of sessions with a client session for it.
    pub fn get_active_client_session_stats(
        &self,
        realm: &RealmModel,
        offline: bool,
    ) -> Result<HashMap<String, usize>> {
        if offline {
            return self.caches.persister().get_user_sessions_count_by_clients(realm, true);
        }

        let mut stats = HashMap::new();
        for session in self
            .caches
            .user_sessions(false)
            .store()
            .values_where(|session| session.realm_id == realm.id)
        {
            for client_id in session.entity().authenticated_client_sessions.keys() {
                *stats.entry(client_id.clone()).or_insert(0) += 1;
            }
        }
        Ok(stats)
    }

    pub fn get_offline_sessions_count(&self, realm: &RealmModel, client_id: &str) -> Result<usize> {
        self.caches
            .persister()
            .get_user_sessions_count_for_client(realm, client_id, true)
    }

    // == Offline Sessions ==
    /// Creates the offline copy of an online session, without its client sessions.
    pub fn create_offline_user_session(
        &mut self,
        user_session: &UserSession,
    ) -> Result<UserSession> {
        let now = self.now();
        let mut entity = user_session.entity().clone();
        entity.started = now;
        entity.last_session_refresh = now;
        entity.authenticated_client_sessions.clear();

        self.offline_sessions_tx.add_task_with_entity(
            entity.id.clone(),
            SessionUpdateTask::add_if_absent(),
            entity.clone(),
            PersistenceState::Persistent,
        )?;
        self.caches.persister().create_user_session(&entity, true)?;

        debug!(session = %entity.id, "Created offline user session");
        Ok(UserSession {
            entity,
            offline: true,
            persistence: PersistenceState::Persistent,
        })
    }

    pub fn remove_offline_user_session(
        &mut self,
        realm: &RealmModel,
        session: &UserSession,
    ) -> Result<()> {
        if !session.is_offline() || session.realm_id() != realm.id {
            return Ok(());
        }
        let current = self.current_entity(session);
        self.remove_cascade(&current, true)?;
        self.caches.persister().remove_user_session(session.id(), true)
    }

    pub fn create_offline_client_session(
        &mut self,
        client_session: &ClientSession,
        offline_user_session: &UserSession,
    ) -> Result<ClientSession> {
        let now = self.now();
        let mut entity = client_session.entity().clone();
        entity.id = self.caches.keygen().generate_key_uuid();
        entity.user_session_id = offline_user_session.id().to_string();
        entity.timestamp = now;
        entity.notes.insert(STARTED_AT_NOTE.to_string(), now.to_string());
        entity.notes.insert(
            USER_SESSION_STARTED_AT_NOTE.to_string(),
            offline_user_session.started().to_string(),
        );

        self.offline_client_sessions_tx.add_task_with_entity(
            entity.id,
            SessionUpdateTask::add_if_absent(),
            entity.clone(),
            PersistenceState::Persistent,
        )?;
        self.register_client_session(
            offline_user_session.id(),
            &entity.client_id,
            entity.id,
            true,
        )?;
        self.caches.persister().create_client_session(&entity, true)?;

        Ok(ClientSession { entity, offline: true })
    }

    pub fn get_offline_user_sessions_for_user(
        &mut self,
        realm: &RealmModel,
        user_id: &str,
        first: usize,
        max: Option<usize>,
    ) -> Result<Vec<UserSession>> {
        let persisted = self
            .caches
            .persister()
            .load_user_sessions(realm, SessionFilter::User(user_id), true, first, max)?;
        Ok(self.offline_views(realm, persisted))
    }

    pub fn get_offline_user_sessions_for_client(
        &mut self,
        realm: &RealmModel,
        client_id: &str,
        first: usize,
        max: Option<usize>,
    ) -> Result<Vec<UserSession>> {
        let persisted = self
            .caches
            .persister()
            .load_user_sessions(realm, SessionFilter::Client(client_id), true, first, max)?;
        Ok(self.offline_views(realm, persisted))
    }

    /// Views of persisted offline sessions, importing those not in memory.
    fn offline_views(
        &mut self,
        realm: &RealmModel,
        persisted: Vec<PersistentUserSession>,
    ) -> Vec<UserSession> {
        let mut views = Vec::with_capacity(persisted.len());
        for persistent in persisted {
            let key = persistent.user_session.id.clone();
            if self.offline_sessions_tx.get(&key).is_none() {
                if let Err(e) = self.caches.import_persistent_session(persistent, true) {
                    warn!(session = %key, error = %e, "Failed to import offline session");
                    continue;
                }
            }
            if let Some(view) = self.load_user_session(realm, &key, true) {
                views.push(view);
            }
        }
        views
    }

    // == Import and Expiration ==
    pub fn import_user_sessions(
        &self,
        sessions: Vec<PersistentUserSession>,
        offline: bool,
    ) -> Result<usize> {
        self.caches.import_user_sessions(sessions, offline)
    }

    /// Regions expire their own entries; this purges the persister.
    pub fn remove_expired(&self, realm: &RealmModel) -> Result<usize> {
        self.caches.persister().remove_expired(realm)
    }

    // == Commit ==
    /// Commits the four transactions, then sends the queued cluster events.
    ///
    /// Every step runs even if an earlier one failed; the first error is
    /// returned.
    pub fn commit(&mut self) -> Result<()> {
        let results = [
            self.sessions_tx.commit(),
            self.offline_sessions_tx.commit(),
            self.client_sessions_tx.commit(),
            self.offline_client_sessions_tx.commit(),
        ];
        let mut first_error = results.into_iter().find_map(Result::err);

        for (channel, event, dc_notify) in std::mem::take(&mut self.cluster_events) {
            let event = ClusterEvent::Session(event);
            if let Err(e) = self.caches.cluster().notify(channel, &event, false, dc_notify) {
                warn!(channel, error = %e, "Failed to send session cluster event");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn rollback(&mut self) {
        self.sessions_tx.rollback();
        self.offline_sessions_tx.rollback();
        self.client_sessions_tx.rollback();
        self.offline_client_sessions_tx.rollback();
        self.cluster_events.clear();
    }
}
