//! Authentication session provider
//!
//! Root authentication sessions hold the logins in progress of one browser,
//! one tab-level session per tab id. A root session keeps at most
//! `auth_sessions_limit` tabs; creating one more drops the oldest.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::debug;

use crate::changes::{ChangelogTransaction, SessionUpdateTask};
use crate::cluster::{
    ClusterEvent, DcNotify, SessionClusterEvent, SessionEventKind, AUTHENTICATION_SESSION_EVENTS,
    REALM_REMOVED_EVENT_AUTHSESSIONS,
};
use crate::error::{CacheError, Result};
use crate::models::{
    AuthenticationSessionEntity, PersistenceState, RealmModel, RootAuthenticationSessionEntity,
};
use crate::sessions::SessionCaches;

const TAB_ID_LENGTH: usize = 11;

fn generate_tab_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TAB_ID_LENGTH)
        .map(char::from)
        .collect()
}

// == Authentication Session Provider ==
pub struct AuthenticationSessionProvider {
    caches: Arc<SessionCaches>,
    tx: ChangelogTransaction<String, RootAuthenticationSessionEntity>,
    cluster_events: Vec<(&'static str, SessionClusterEvent, DcNotify)>,
}

impl AuthenticationSessionProvider {
    pub fn new(caches: Arc<SessionCaches>) -> Self {
        let tx = ChangelogTransaction::new(
            caches.auth_sessions().clone(),
            caches.config().replace_retries,
        );
        Self {
            caches,
            tx,
            cluster_events: Vec::new(),
        }
    }

    fn now(&self) -> i64 {
        self.caches.clock().now_secs()
    }

    // == Root Sessions ==
    pub fn create_root_authentication_session(
        &mut self,
        realm: &RealmModel,
        id: Option<String>,
    ) -> Result<RootAuthenticationSessionEntity> {
        let id = id.unwrap_or_else(|| self.caches.keygen().generate_key_string());
        let entity = RootAuthenticationSessionEntity::new(id.clone(), realm.id.clone(), self.now());

        self.tx.add_task_with_entity(
            id,
            SessionUpdateTask::add_if_absent(),
            entity.clone(),
            PersistenceState::Persistent,
        )?;
        Ok(entity)
    }

    pub fn get_root_authentication_session(
        &mut self,
        realm: &RealmModel,
        id: &str,
    ) -> Option<RootAuthenticationSessionEntity> {
        let entity = self.tx.get(&id.to_string())?.into_entity();
        (entity.realm_id == realm.id).then_some(entity)
    }

    pub fn remove_root_authentication_session(
        &mut self,
        realm: &RealmModel,
        id: &str,
    ) -> Result<()> {
        if self.get_root_authentication_session(realm, id).is_none() {
            return Ok(());
        }
        self.tx.add_task(id.to_string(), SessionUpdateTask::remove())
    }

    // == Tab Sessions ==
    /// Adds a tab to the root session and returns it.
    pub fn create_authentication_session(
        &mut self,
        realm: &RealmModel,
        root_id: &str,
        client_uuid: &str,
    ) -> Result<AuthenticationSessionEntity> {
        let root = self
            .get_root_authentication_session(realm, root_id)
            .ok_or_else(|| {
                CacheError::InvalidRequest(format!(
                    "root authentication session {root_id} not found"
                ))
            })?;

        let mut tab_id = generate_tab_id();
        while root.authentication_sessions.contains_key(&tab_id) {
            tab_id = generate_tab_id();
        }

        let limit = self.caches.config().auth_sessions_limit.max(1);
        if root.authentication_sessions.len() >= limit {
            debug!(
                root = %root_id,
                limit,
                "Reached authentication sessions limit, removing the oldest tab"
            );
        }

        let now = self.now();
        let tab = AuthenticationSessionEntity::new(client_uuid, tab_id.clone(), now);
        let created = tab.clone();
        self.tx.add_task(
            root_id.to_string(),
            SessionUpdateTask::replace(move |root: &mut RootAuthenticationSessionEntity| {
                while root.authentication_sessions.len() >= limit {
                    let Some(oldest) = root.oldest_tab().map(str::to_string) else {
                        break;
                    };
                    root.authentication_sessions.remove(&oldest);
                }
                root.authentication_sessions.insert(tab.tab_id.clone(), tab.clone());
                root.timestamp = now;
            }),
        )?;
        Ok(created)
    }

    pub fn get_authentication_session(
        &mut self,
        realm: &RealmModel,
        root_id: &str,
        client_uuid: &str,
        tab_id: &str,
    ) -> Option<AuthenticationSessionEntity> {
        let mut root = self.get_root_authentication_session(realm, root_id)?;
        root.authentication_sessions
            .remove(tab_id)
            .filter(|tab| tab.client_uuid == client_uuid)
    }

    /// Removes the tab; a root session left without tabs is removed too.
    pub fn remove_authentication_session(
        &mut self,
        realm: &RealmModel,
        root_id: &str,
        tab_id: &str,
    ) -> Result<()> {
        let Some(root) = self.get_root_authentication_session(realm, root_id) else {
            return Ok(());
        };
        if !root.authentication_sessions.contains_key(tab_id) {
            return Ok(());
        }

        if root.authentication_sessions.len() == 1 {
            debug!(root = %root_id, "Last tab removed, removing root authentication session");
            return self.tx.add_task(root_id.to_string(), SessionUpdateTask::remove());
        }

        let tab_id = tab_id.to_string();
        let now = self.now();
        self.tx.add_task(
            root_id.to_string(),
            SessionUpdateTask::replace(move |root: &mut RootAuthenticationSessionEntity| {
                root.authentication_sessions.remove(&tab_id);
                root.timestamp = now;
            }),
        )
    }

    pub fn set_auth_note(
        &mut self,
        realm: &RealmModel,
        root_id: &str,
        tab_id: &str,
        name: &str,
        value: &str,
    ) -> Result<()> {
        if self.get_root_authentication_session(realm, root_id).is_none() {
            return Ok(());
        }
        let (tab_id, name, value) = (tab_id.to_string(), name.to_string(), value.to_string());
        self.tx.add_task(
            root_id.to_string(),
            SessionUpdateTask::replace(move |root: &mut RootAuthenticationSessionEntity| {
                if let Some(tab) = root.authentication_sessions.get_mut(&tab_id) {
                    tab.auth_notes.insert(name.clone(), value.clone());
                }
            }),
        )
    }

    /// Sends auth notes to the copies of the tab held by other nodes.
    ///
    /// A `None` value removes the note. Sent immediately, not on commit.
    pub fn update_non_local_session_auth_notes(
        &self,
        root_id: &str,
        tab_id: &str,
        notes: BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let Some(realm_id) = self
            .caches
            .auth_sessions()
            .store()
            .peek(&root_id.to_string())
            .map(|root| root.entity().realm_id.clone())
        else {
            debug!(
                root = %root_id,
                "Root authentication session not found locally, notes not sent",
            );
            return Ok(());
        };

        let event = self.event(
            SessionEventKind::AuthNotesUpdated {
                auth_session_id: root_id.to_string(),
                tab_id: tab_id.to_string(),
                notes,
            },
            &realm_id,
        );
        self.caches.cluster().notify(
            AUTHENTICATION_SESSION_EVENTS,
            &ClusterEvent::Session(event),
            true,
            DcNotify::AllDcs,
        )
    }

    fn event(&self, kind: SessionEventKind, realm_id: &str) -> SessionClusterEvent {
        let topology = self.caches.topology();
        SessionClusterEvent::new(
            kind,
            realm_id,
            Some(topology.node_name().to_string()),
            topology.site_name().map(str::to_string),
        )
    }

    /// Removes the realm's authentication sessions on every node after commit.
    pub fn on_realm_removed(&mut self, realm_id: &str) {
        let event = self.event(SessionEventKind::AuthSessionsRealmRemoved, realm_id);
        self.cluster_events
            .push((REALM_REMOVED_EVENT_AUTHSESSIONS, event, DcNotify::AllDcs));
    }

    // == Commit ==
    pub fn commit(&mut self) -> Result<()> {
        let mut first_error = self.tx.commit().err();
        for (channel, event, dc_notify) in std::mem::take(&mut self.cluster_events) {
            if let Err(e) = self
                .caches
                .cluster()
                .notify(channel, &ClusterEvent::Session(event), false, dc_notify)
            {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn rollback(&mut self) {
        self.tx.rollback();
        self.cluster_events.clear();
    }
}
