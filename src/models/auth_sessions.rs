//! Authentication session entities
//!
//! A root authentication session groups the in-progress logins of one browser,
//! one tab-level authentication session per tab id.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::models::SessionEntity;

/// Login in progress in one browser tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationSessionEntity {
    pub client_uuid: String,
    pub tab_id: String,
    /// Unix seconds of creation
    pub timestamp: i64,
    pub auth_user_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub action: Option<String>,
    pub protocol: Option<String>,
    pub client_notes: HashMap<String, String>,
    pub auth_notes: HashMap<String, String>,
    pub required_actions: BTreeSet<String>,
}

impl AuthenticationSessionEntity {
    pub fn new(client_uuid: impl Into<String>, tab_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            client_uuid: client_uuid.into(),
            tab_id: tab_id.into(),
            timestamp,
            auth_user_id: None,
            redirect_uri: None,
            action: None,
            protocol: None,
            client_notes: HashMap::new(),
            auth_notes: HashMap::new(),
            required_actions: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootAuthenticationSessionEntity {
    pub id: String,
    pub realm_id: String,
    /// Unix seconds of the last change
    pub timestamp: i64,
    /// tab id -> authentication session
    pub authentication_sessions: HashMap<String, AuthenticationSessionEntity>,
}

impl RootAuthenticationSessionEntity {
    pub fn new(id: impl Into<String>, realm_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            id: id.into(),
            realm_id: realm_id.into(),
            timestamp,
            authentication_sessions: HashMap::new(),
        }
    }

    /// Tab id of the oldest authentication session, if any.
    pub fn oldest_tab(&self) -> Option<&str> {
        self.authentication_sessions
            .values()
            .min_by_key(|session| session.timestamp)
            .map(|session| session.tab_id.as_str())
    }
}

impl SessionEntity for RootAuthenticationSessionEntity {
    fn realm_id(&self) -> &str {
        &self.realm_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_tab() {
        let mut root = RootAuthenticationSessionEntity::new("root", "r1", 0);
        assert_eq!(root.oldest_tab(), None);

        for (tab, ts) in [("b", 20), ("a", 10), ("c", 30)] {
            root.authentication_sessions
                .insert(tab.to_string(), AuthenticationSessionEntity::new("client", tab, ts));
        }

        assert_eq!(root.oldest_tab(), Some("a"));
    }
}
