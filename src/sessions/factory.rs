//! Session cache factory
//!
//! `SessionCaches` is the node-wide state shared by every request: the
//! session regions, the collaborators and the cluster wiring. Providers are
//! created from it per request.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::cache::{CacheKey, EntityStore, SessionFunction, SessionEntityWrapper, SessionRegion};
use crate::changes::timeouts;
use crate::clock::{Clock, SystemClock};
use crate::cluster::{
    ClusterEvent, ClusterProvider, DcNotify, InMemoryCluster, InvalidationBus, RealmCacheManager,
    SessionClusterEvent, SessionEventKind, AUTHENTICATION_SESSION_EVENTS,
    REALM_REMOVED_EVENT_AUTHSESSIONS, REALM_REMOVED_SESSION_EVENT, REMOVE_USER_SESSIONS_EVENT,
};
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::models::{
    AuthenticatedClientSessionEntity, ModelDirectory, RootAuthenticationSessionEntity,
    SessionEntity, UserSessionEntity,
};
use crate::remote::{
    LocalOwnership, PartitionOwnership, RemoteCacheEvent, RemoteCacheInvoker,
    RemoteCacheSessionListener, RemoteEventHandler, RemoteStore, TopologyInfo,
};
use crate::sessions::{
    AuthenticationSessionProvider, ClusterKeyGenerator, InMemoryUserSessionPersister, KeyGenerator,
    PersistentUserSession, UserSessionPersister, UserSessionProvider,
};

// == Region Names ==
pub const USER_SESSIONS: &str = "sessions";
pub const OFFLINE_USER_SESSIONS: &str = "offlineSessions";
pub const CLIENT_SESSIONS: &str = "clientSessions";
pub const OFFLINE_CLIENT_SESSIONS: &str = "offlineClientSessions";
pub const AUTHENTICATION_SESSIONS: &str = "authenticationSessions";

pub type UserSessionRegion = SessionRegion<String, UserSessionEntity>;
pub type ClientSessionRegion = SessionRegion<Uuid, AuthenticatedClientSessionEntity>;
pub type AuthSessionRegion = SessionRegion<String, RootAuthenticationSessionEntity>;

/// A remote listener and the notifications it consumes.
pub type RemoteListener = (Arc<dyn RemoteEventHandler>, UnboundedReceiver<RemoteCacheEvent>);

// == Session Caches ==
pub struct SessionCaches {
    config: Config,
    clock: Arc<dyn Clock>,
    directory: Arc<dyn ModelDirectory>,
    persister: Arc<dyn UserSessionPersister>,
    keygen: Arc<dyn KeyGenerator>,
    cluster: Arc<dyn ClusterProvider>,
    topology: TopologyInfo,
    invalidations: InvalidationBus,
    sessions: UserSessionRegion,
    offline_sessions: UserSessionRegion,
    client_sessions: ClientSessionRegion,
    offline_client_sessions: ClientSessionRegion,
    auth_sessions: AuthSessionRegion,
}

impl SessionCaches {
    pub fn builder(config: Config) -> SessionCachesBuilder {
        SessionCachesBuilder::new(config)
    }

    // == Accessors ==
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn directory(&self) -> &Arc<dyn ModelDirectory> {
        &self.directory
    }

    pub fn persister(&self) -> &Arc<dyn UserSessionPersister> {
        &self.persister
    }

    pub fn keygen(&self) -> &Arc<dyn KeyGenerator> {
        &self.keygen
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterProvider> {
        &self.cluster
    }

    pub fn topology(&self) -> &TopologyInfo {
        &self.topology
    }

    pub fn invalidations(&self) -> &InvalidationBus {
        &self.invalidations
    }

    pub fn realm_cache(&self) -> &Arc<RealmCacheManager> {
        self.invalidations.realm_cache()
    }

    pub fn user_sessions(&self, offline: bool) -> &UserSessionRegion {
        if offline {
            &self.offline_sessions
        } else {
            &self.sessions
        }
    }

    pub fn client_sessions(&self, offline: bool) -> &ClientSessionRegion {
        if offline {
            &self.offline_client_sessions
        } else {
            &self.client_sessions
        }
    }

    pub fn auth_sessions(&self) -> &AuthSessionRegion {
        &self.auth_sessions
    }

    // == Providers ==
    /// Per-request user session provider.
    pub fn provider(self: &Arc<Self>) -> UserSessionProvider {
        UserSessionProvider::new(self.clone())
    }

    /// Per-request authentication session provider.
    pub fn auth_provider(self: &Arc<Self>) -> AuthenticationSessionProvider {
        AuthenticationSessionProvider::new(self.clone())
    }

    // == Local Removal ==
    /// Drops every user and client session of the realm from this node's
    /// regions, without touching other nodes or the remote store.
    pub fn remove_local_user_sessions(&self, realm_id: &str, offline: bool) -> usize {
        let removed = self
            .user_sessions(offline)
            .store()
            .remove_where(|_, session| session.realm_id == realm_id)
            .len();
        let removed_clients = self
            .client_sessions(offline)
            .store()
            .remove_where(|_, session| session.realm_id == realm_id)
            .len();
        debug!(
            node = %self.topology.node_name(),
            realm = %realm_id,
            offline,
            removed,
            removed_clients,
            "Removed local user sessions"
        );
        removed
    }

    pub fn remove_local_auth_sessions(&self, realm_id: &str) -> usize {
        let removed = self
            .auth_sessions
            .store()
            .remove_where(|_, session| session.realm_id == realm_id)
            .len();
        debug!(
            node = %self.topology.node_name(),
            realm = %realm_id,
            removed,
            "Removed local authentication sessions",
        );
        removed
    }

    /// Applies auth notes received from another node to the local copy of a tab.
    pub fn update_auth_notes(
        &self,
        root_session_id: &str,
        tab_id: &str,
        notes: &BTreeMap<String, Option<String>>,
    ) {
        let store = self.auth_sessions.store();
        let key = root_session_id.to_string();

        for _ in 0..self.config.replace_retries.max(1) {
            let Some(current) = store.peek(&key) else {
                trace!(
                    root = %root_session_id,
                    "Authentication session not present locally, notes ignored",
                );
                return;
            };
            let mut updated = current.clone();
            let Some(tab) = updated.entity_mut().authentication_sessions.get_mut(tab_id) else {
                return;
            };
            for (name, value) in notes {
                match value {
                    Some(value) => tab.auth_notes.insert(name.clone(), value.clone()),
                    None => tab.auth_notes.remove(name),
                };
            }
            let expiration = self.auth_sessions.expiration_for(updated.entity());
            if store.replace(&key, &current, updated, expiration) {
                return;
            }
        }
        warn!(root = %root_session_id, tab = %tab_id, "Failed to apply auth notes update");
    }

    // == Import ==
    /// Writes an entity straight to a region, bypassing any transaction, and
    /// mirrors it to the remote store when one is configured.
    ///
    /// Returns false when the entity is already expired and nothing was written.
    pub(crate) fn import_entity<K: CacheKey, V: SessionEntity>(
        region: &SessionRegion<K, V>,
        key: K,
        entity: &V,
    ) -> Result<bool> {
        let expiration = region.expiration_for(entity);
        if expiration.is_expired() {
            trace!(region = %region.name(), key = %key, "Entity already expired, not imported");
            return Ok(false);
        }

        let remote_key = key.to_string();
        region
            .store()
            .put(key, SessionEntityWrapper::new(entity.clone()), expiration);
        if let Some(invoker) = region.remote() {
            invoker.put(&remote_key, entity, expiration)?;
        }
        Ok(true)
    }

    /// Imports one persisted user session and its client sessions.
    ///
    /// Returns false when the user session is already expired.
    pub(crate) fn import_persistent_session(
        &self,
        persistent: PersistentUserSession,
        offline: bool,
    ) -> Result<bool> {
        let PersistentUserSession {
            mut user_session,
            client_sessions,
        } = persistent;

        user_session.authenticated_client_sessions = client_sessions
            .iter()
            .map(|client_session| (client_session.client_id.clone(), client_session.id))
            .collect();

        let user_session_id = user_session.id.clone();
        let last_refresh = user_session.last_session_refresh;
        if !Self::import_entity(
            self.user_sessions(offline),
            user_session_id.clone(),
            &user_session,
        )? {
            return Ok(false);
        }

        for mut client_session in client_sessions {
            client_session.user_session_id = user_session_id.clone();
            if offline {
                // The persisted user session refresh is authoritative
                client_session.timestamp = last_refresh;
            }
            Self::import_entity(self.client_sessions(offline), client_session.id, &client_session)?;
        }
        Ok(true)
    }

    /// Imports persisted sessions into the regions; returns how many user
    /// sessions were written.
    pub fn import_user_sessions(
        &self,
        sessions: Vec<PersistentUserSession>,
        offline: bool,
    ) -> Result<usize> {
        let total = sessions.len();
        let mut imported = 0;
        for persistent in sessions {
            if self.import_persistent_session(persistent, offline)? {
                imported += 1;
            }
        }
        debug!(offline, total, imported, "Imported user sessions");
        Ok(imported)
    }

    // == Maintenance ==
    /// Purges expired entries from every region and expired persisted sessions.
    pub fn remove_expired(&self) -> usize {
        let mut removed = self.sessions.store().cleanup_expired()
            + self.offline_sessions.store().cleanup_expired()
            + self.client_sessions.store().cleanup_expired()
            + self.offline_client_sessions.store().cleanup_expired()
            + self.auth_sessions.store().cleanup_expired();

        for realm in self.directory.realms() {
            match self.persister.remove_expired(&realm) {
                Ok(count) => removed += count,
                Err(e) => warn!(
                    realm = %realm.id,
                    error = %e,
                    "Failed to remove expired persistent sessions",
                ),
            }
        }
        removed
    }

    /// Stops all regions; remote listeners ignore further notifications.
    pub fn stop(&self) {
        self.sessions.store().stop();
        self.offline_sessions.store().stop();
        self.client_sessions.store().stop();
        self.offline_client_sessions.store().stop();
        self.auth_sessions.store().stop();
        info!(node = %self.topology.node_name(), "Session caches stopped");
    }

    // == Remote Listeners ==
    /// Subscribes a listener to the remote store of each mirrored region.
    pub fn remote_listeners(&self) -> Vec<RemoteListener> {
        let mut listeners = Vec::new();
        listeners.extend(self.remote_listener(&self.sessions));
        listeners.extend(self.remote_listener(&self.offline_sessions));
        listeners.extend(self.remote_listener(&self.client_sessions));
        listeners.extend(self.remote_listener(&self.offline_client_sessions));
        listeners.extend(self.remote_listener(&self.auth_sessions));
        listeners
    }

    fn remote_listener<K: CacheKey, V: SessionEntity>(
        &self,
        region: &SessionRegion<K, V>,
    ) -> Option<RemoteListener> {
        let invoker = region.remote()?.clone();
        let receiver = invoker.remote().subscribe();
        let listener = RemoteCacheSessionListener::new(
            region.clone(),
            invoker,
            self.topology.clone(),
            self.config.listener_settings(),
        );
        info!(region = %region.name(), "Registered remote store listener");
        Some((Arc::new(listener), receiver))
    }

    // == Cluster Listeners ==
    fn register_cluster_listeners(self: &Arc<Self>) {
        for channel in [REALM_REMOVED_SESSION_EVENT, REMOVE_USER_SESSIONS_EVENT] {
            let caches = Arc::downgrade(self);
            self.cluster.register_listener(
                channel,
                Arc::new(move |event: &ClusterEvent| {
                    if let (ClusterEvent::Session(event), Some(caches)) =
                        (event, caches.upgrade())
                    {
                        caches.on_user_session_event(channel, event);
                    }
                }),
            );
        }

        for channel in [REALM_REMOVED_EVENT_AUTHSESSIONS, AUTHENTICATION_SESSION_EVENTS] {
            let caches: Weak<Self> = Arc::downgrade(self);
            self.cluster.register_listener(
                channel,
                Arc::new(move |event: &ClusterEvent| {
                    if let (ClusterEvent::Session(event), Some(caches)) =
                        (event, caches.upgrade())
                    {
                        caches.on_auth_session_event(event);
                    }
                }),
            );
        }
        info!(node = %self.topology.node_name(), "Registered session cluster listeners");
    }

    fn on_user_session_event(&self, channel: &str, event: &SessionClusterEvent) {
        match event.kind {
            SessionEventKind::RealmRemoved => {
                self.remove_local_user_sessions(&event.realm_id, true);
                self.remove_local_user_sessions(&event.realm_id, false);
            }
            SessionEventKind::RemoveUserSessions => {
                self.remove_local_user_sessions(&event.realm_id, false);
            }
            _ => {
                debug!(channel, event = %event, "Unexpected event on user session channel");
                return;
            }
        }

        if self.should_resend(event) {
            debug!(channel, event = %event, "Re-sending event to other sites");
            let resent = ClusterEvent::Session(event.resend());
            if let Err(e) = self.cluster.notify(channel, &resent, true, DcNotify::AllButLocalDc) {
                warn!(channel, error = %e, "Failed to re-send event to other sites");
            }
        }
    }

    /// Only the originator forwards an event to the other sites, once.
    fn should_resend(&self, event: &SessionClusterEvent) -> bool {
        let Some(site) = self.topology.site_name() else {
            return false;
        };
        !event.resending
            && event.node_id.as_deref() == Some(self.topology.node_name())
            && event.site_id.as_deref() == Some(site)
    }

    fn on_auth_session_event(&self, event: &SessionClusterEvent) {
        match &event.kind {
            SessionEventKind::AuthSessionsRealmRemoved => {
                self.remove_local_auth_sessions(&event.realm_id);
            }
            SessionEventKind::AuthNotesUpdated {
                auth_session_id,
                tab_id,
                notes,
            } => self.update_auth_notes(auth_session_id, tab_id, notes),
            _ => debug!(event = %event, "Unexpected event on authentication session channel"),
        }
    }
}

// == Builder ==
/// Assembles `SessionCaches` from its collaborators. Only the model
/// directory is required; everything else has an in-memory default.
pub struct SessionCachesBuilder {
    config: Config,
    clock: Option<Arc<dyn Clock>>,
    directory: Option<Arc<dyn ModelDirectory>>,
    persister: Option<Arc<dyn UserSessionPersister>>,
    keygen: Option<Arc<dyn KeyGenerator>>,
    cluster: Option<Arc<dyn ClusterProvider>>,
    ownership: Option<Arc<dyn PartitionOwnership>>,
    remote_stores: HashMap<String, Arc<dyn RemoteStore>>,
}

impl SessionCachesBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            clock: None,
            directory: None,
            persister: None,
            keygen: None,
            cluster: None,
            ownership: None,
            remote_stores: HashMap::new(),
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn ModelDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn persister(mut self, persister: Arc<dyn UserSessionPersister>) -> Self {
        self.persister = Some(persister);
        self
    }

    pub fn keygen(mut self, keygen: Arc<dyn KeyGenerator>) -> Self {
        self.keygen = Some(keygen);
        self
    }

    pub fn cluster(mut self, cluster: Arc<dyn ClusterProvider>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn ownership(mut self, ownership: Arc<dyn PartitionOwnership>) -> Self {
        self.ownership = Some(ownership);
        self
    }

    /// Remote store mirroring the named region; used only when
    /// `remote_store_enabled` is set.
    pub fn remote_store(mut self, region: &str, store: Arc<dyn RemoteStore>) -> Self {
        self.remote_stores.insert(region.to_string(), store);
        self
    }

    pub fn build(self) -> Result<Arc<SessionCaches>> {
        let directory = self
            .directory
            .clone()
            .ok_or_else(|| {
                CacheError::InvalidRequest("a model directory is required".to_string())
            })?;
        let clock = self.clock.clone().unwrap_or_else(|| Arc::new(SystemClock));

        let cluster = match &self.cluster {
            Some(cluster) => cluster.clone(),
            None => {
                let node: Arc<dyn ClusterProvider> = InMemoryCluster::new()
                    .join(self.config.resolve_node_name(), self.config.site_name.clone());
                node
            }
        };
        let ownership = self
            .ownership
            .clone()
            .unwrap_or_else(|| Arc::new(LocalOwnership));
        let topology = TopologyInfo::new(
            cluster.node_name(),
            cluster.site_name().map(str::to_string),
            ownership,
        );

        let keygen = self
            .keygen
            .clone()
            .unwrap_or_else(|| Arc::new(ClusterKeyGenerator::new(topology.clone())));
        let persister = self
            .persister
            .clone()
            .unwrap_or_else(|| Arc::new(InMemoryUserSessionPersister::new(clock.clone())));

        let offline_override = self.config.offline_session_cache_entry_lifespan_override;
        let session_max = self.config.session_cache_max_entries;
        let offline_max = self.config.offline_session_cache_max_entries;

        let offline_lifespan: SessionFunction<UserSessionEntity> =
            Arc::new(timeouts::offline_session_lifespan);
        let offline_client_lifespan: SessionFunction<AuthenticatedClientSessionEntity> =
            Arc::new(timeouts::offline_client_session_lifespan);
        let offline_lifespan = timeouts::with_lifespan_override(offline_lifespan, offline_override);
        let offline_client_lifespan =
            timeouts::with_lifespan_override(offline_client_lifespan, offline_override);

        let sessions: UserSessionRegion = self.region(
            USER_SESSIONS,
            session_max,
            Arc::new(timeouts::user_session_lifespan),
            Arc::new(timeouts::user_session_max_idle),
            &clock,
            &directory,
        );
        let offline_sessions: UserSessionRegion = self.region(
            OFFLINE_USER_SESSIONS,
            offline_max,
            offline_lifespan,
            Arc::new(timeouts::offline_session_max_idle),
            &clock,
            &directory,
        );
        let client_sessions: ClientSessionRegion = self.region(
            CLIENT_SESSIONS,
            session_max,
            Arc::new(timeouts::client_session_lifespan),
            Arc::new(timeouts::client_session_max_idle),
            &clock,
            &directory,
        );
        let offline_client_sessions: ClientSessionRegion = self.region(
            OFFLINE_CLIENT_SESSIONS,
            offline_max,
            offline_client_lifespan,
            Arc::new(timeouts::offline_client_session_max_idle),
            &clock,
            &directory,
        );
        let auth_sessions: AuthSessionRegion = self.region(
            AUTHENTICATION_SESSIONS,
            0,
            Arc::new(timeouts::auth_session_lifespan),
            Arc::new(timeouts::immortal::<RootAuthenticationSessionEntity>),
            &clock,
            &directory,
        );

        let realm_cache = Arc::new(RealmCacheManager::new(0, clock.clone()));
        let invalidations = InvalidationBus::new(realm_cache, cluster.clone());
        invalidations.register();

        let caches = Arc::new(SessionCaches {
            config: self.config,
            clock,
            directory,
            persister,
            keygen,
            cluster,
            topology,
            invalidations,
            sessions,
            offline_sessions,
            client_sessions,
            offline_client_sessions,
            auth_sessions,
        });
        caches.register_cluster_listeners();

        info!(
            node = %caches.topology.node_name(),
            site = ?caches.topology.site_name(),
            remote_store = caches.config.remote_store_enabled,
            "Session caches initialized"
        );
        Ok(caches)
    }

    fn region<K: CacheKey, V: SessionEntity>(
        &self,
        name: &str,
        max_entries: usize,
        lifespan: SessionFunction<V>,
        max_idle: SessionFunction<V>,
        clock: &Arc<dyn Clock>,
        directory: &Arc<dyn ModelDirectory>,
    ) -> SessionRegion<K, V> {
        let store = Arc::new(EntityStore::new(name, max_entries, clock.clone()));
        let region = SessionRegion::new(store, lifespan, max_idle, directory.clone());

        if !self.config.remote_store_enabled {
            return region;
        }
        match self.remote_stores.get(name) {
            Some(remote) => region.with_remote(Arc::new(RemoteCacheInvoker::new(
                remote.clone(),
                self.config.retry_policy(),
                self.config.replace_retries,
            ))),
            None => region,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{InMemoryDirectory, RealmModel};
    use crate::remote::InMemoryRemoteStore;

    const NOW: i64 = 1_000_000;

    fn directory() -> Arc<InMemoryDirectory> {
        let directory = Arc::new(InMemoryDirectory::new());
        directory.add_realm(RealmModel::new("r1", "acme"));
        directory
    }

    #[test]
    fn test_build_requires_directory() {
        let result = SessionCaches::builder(Config::default()).build();
        assert!(matches!(result, Err(CacheError::InvalidRequest(_))));
    }

    #[test]
    fn test_remote_regions_only_when_enabled() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_secs(NOW));
        let remote: Arc<dyn RemoteStore> = Arc::new(InMemoryRemoteStore::new(
            USER_SESSIONS,
            clock.clone(),
        ));

        let disabled = SessionCaches::builder(Config::default())
            .clock(clock.clone())
            .directory(directory())
            .remote_store(USER_SESSIONS, remote.clone())
            .build()
            .unwrap();
        assert!(disabled.user_sessions(false).remote().is_none());
        assert!(disabled.remote_listeners().is_empty());

        let config = Config {
            remote_store_enabled: true,
            ..Config::default()
        };
        let enabled = SessionCaches::builder(config)
            .clock(clock)
            .directory(directory())
            .remote_store(USER_SESSIONS, remote)
            .build()
            .unwrap();
        assert!(enabled.user_sessions(false).remote().is_some());
        assert!(enabled.user_sessions(true).remote().is_none());
        assert_eq!(enabled.remote_listeners().len(), 1);
    }

    #[test]
    fn test_remove_local_user_sessions_only_touches_realm() {
        let caches = SessionCaches::builder(Config::default())
            .clock(Arc::new(ManualClock::at_secs(NOW)))
            .directory(directory())
            .build()
            .unwrap();
        let mut keep = UserSessionEntity::new("keep", "r2", "u1");
        keep.started = NOW;
        keep.last_session_refresh = NOW;
        let store = caches.user_sessions(false).store();
        store.put(
            "keep".into(),
            SessionEntityWrapper::new(keep),
            crate::cache::Expiration::immortal(),
        );
        store.put(
            "drop".into(),
            SessionEntityWrapper::new(UserSessionEntity::new("drop", "r1", "u1")),
            crate::cache::Expiration::immortal(),
        );

        assert_eq!(caches.remove_local_user_sessions("r1", false), 1);
        assert!(store.contains_key(&"keep".to_string()));
    }
}
