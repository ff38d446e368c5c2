//! Session cluster events
//!
//! Realm-wide session operations (realm removed, remove all user sessions)
//! and authentication note updates broadcast between nodes. Each event names
//! the node and site it came from so the originator can re-send it to other
//! datacenters.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

use crate::cluster::wire::{WireReader, WireWriter};
use crate::error::WireError;

// == Channels ==
pub const REALM_REMOVED_SESSION_EVENT: &str = "REALM_REMOVED_EVENT_SESSIONS";
pub const REMOVE_USER_SESSIONS_EVENT: &str = "REMOVE_USER_SESSIONS_EVENT";
pub const REALM_REMOVED_EVENT_AUTHSESSIONS: &str = "REALM_REMOVED_EVENT_AUTHSESSIONS";
pub const AUTHENTICATION_SESSION_EVENTS: &str = "AUTHENTICATION_SESSIONS_EVENTS";

const VERSION_1: u8 = 1;

pub(crate) const TAG_REALM_REMOVED_SESSIONS: u8 = 16;
pub(crate) const TAG_REMOVE_USER_SESSIONS: u8 = 17;
pub(crate) const TAG_AUTH_SESSIONS_REALM_REMOVED: u8 = 18;
pub(crate) const TAG_AUTH_NOTES_UPDATED: u8 = 19;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEventKind {
    RealmRemoved,
    RemoveUserSessions,
    AuthSessionsRealmRemoved,
    /// Notes to set on one tab of a root authentication session; `None`
    /// removes the note
    AuthNotesUpdated {
        auth_session_id: String,
        tab_id: String,
        notes: BTreeMap<String, Option<String>>,
    },
}

impl SessionEventKind {
    fn tag(&self) -> u8 {
        match self {
            SessionEventKind::RealmRemoved => TAG_REALM_REMOVED_SESSIONS,
            SessionEventKind::RemoveUserSessions => TAG_REMOVE_USER_SESSIONS,
            SessionEventKind::AuthSessionsRealmRemoved => TAG_AUTH_SESSIONS_REALM_REMOVED,
            SessionEventKind::AuthNotesUpdated { .. } => TAG_AUTH_NOTES_UPDATED,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            SessionEventKind::RealmRemoved => "RealmRemovedSessionEvent",
            SessionEventKind::RemoveUserSessions => "RemoveUserSessionsEvent",
            SessionEventKind::AuthSessionsRealmRemoved => "RealmRemovedAuthSessionsEvent",
            SessionEventKind::AuthNotesUpdated { .. } => "AuthenticationSessionAuthNoteUpdateEvent",
        }
    }
}

/// Session event plus the node and site that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClusterEvent {
    pub kind: SessionEventKind,
    pub realm_id: String,
    pub node_id: Option<String>,
    pub site_id: Option<String>,
    /// Set when the originator forwards the event to the other sites
    pub resending: bool,
}

impl SessionClusterEvent {
    pub fn new(
        kind: SessionEventKind,
        realm_id: impl Into<String>,
        node_id: Option<String>,
        site_id: Option<String>,
    ) -> Self {
        Self {
            kind,
            realm_id: realm_id.into(),
            node_id,
            site_id,
            resending: false,
        }
    }

    /// Copy flagged for re-sending to other sites.
    pub fn resend(&self) -> Self {
        Self {
            resending: true,
            ..self.clone()
        }
    }

    pub(crate) fn is_tag(tag: u8) -> bool {
        (TAG_REALM_REMOVED_SESSIONS..=TAG_AUTH_NOTES_UPDATED).contains(&tag)
    }

    // == Encoding ==
    pub fn encode(&self, writer: &mut WireWriter) {
        writer
            .put_u8(self.kind.tag())
            .put_u8(VERSION_1)
            .put_string(&self.realm_id)
            .put_opt_string(self.node_id.as_deref())
            .put_opt_string(self.site_id.as_deref())
            .put_bool(self.resending);

        if let SessionEventKind::AuthNotesUpdated { auth_session_id, tab_id, notes } = &self.kind {
            writer
                .put_string(auth_session_id)
                .put_string(tab_id)
                .put_u32(notes.len() as u32);
            for (name, value) in notes {
                writer.put_string(name).put_opt_string(value.as_deref());
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut writer = WireWriter::new();
        self.encode(&mut writer);
        writer.finish()
    }

    // == Decoding ==
    pub fn decode(reader: &mut WireReader) -> Result<Self, WireError> {
        let tag = reader.get_u8("type")?;
        if !Self::is_tag(tag) {
            return Err(WireError::UnknownEventType(tag));
        }
        let version = reader.get_u8("version")?;
        if version != VERSION_1 {
            return Err(WireError::UnknownVersion {
                event: "SessionClusterEvent",
                version,
            });
        }

        let realm_id = reader.get_string("realmId")?;
        let node_id = reader.get_opt_string("nodeId")?;
        let site_id = reader.get_opt_string("siteId")?;
        let resending = reader.get_bool("resending")?;

        let kind = match tag {
            TAG_REALM_REMOVED_SESSIONS => SessionEventKind::RealmRemoved,
            TAG_REMOVE_USER_SESSIONS => SessionEventKind::RemoveUserSessions,
            TAG_AUTH_SESSIONS_REALM_REMOVED => SessionEventKind::AuthSessionsRealmRemoved,
            _ => {
                let auth_session_id = reader.get_string("authSessionId")?;
                let tab_id = reader.get_string("tabId")?;
                let count = reader.get_u32("notes")?;
                let mut notes = BTreeMap::new();
                for _ in 0..count {
                    let name = reader.get_string("noteName")?;
                    let value = reader.get_opt_string("noteValue")?;
                    notes.insert(name, value);
                }
                SessionEventKind::AuthNotesUpdated { auth_session_id, tab_id, notes }
            }
        };

        Ok(Self {
            kind,
            realm_id,
            node_id,
            site_id,
            resending,
        })
    }
}

impl fmt::Display for SessionClusterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [ realmId={}, nodeId={}, siteId={}, resending={} ]",
            self.kind.name(),
            self.realm_id,
            self.node_id.as_deref().unwrap_or("-"),
            self.site_id.as_deref().unwrap_or("-"),
            self.resending
        )
    }
}
