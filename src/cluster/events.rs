//! Invalidation events
//!
//! Realm cache invalidation events and their wire format: one type tag byte,
//! one version byte, then the event fields.

use std::collections::HashSet;
use std::fmt;

use bytes::Bytes;

use crate::cluster::wire::{WireReader, WireWriter};
use crate::cluster::RealmCacheManager;
use crate::error::WireError;

const VERSION_1: u8 = 1;
const VERSION_2: u8 = 2;

// == Type Tags ==
pub(crate) const TAG_REALM_UPDATED: u8 = 1;
pub(crate) const TAG_REALM_REMOVED: u8 = 2;
pub(crate) const TAG_GROUP_ADDED: u8 = 3;
pub(crate) const TAG_GROUP_REMOVED: u8 = 4;
pub(crate) const TAG_ROLE_ADDED: u8 = 5;
pub(crate) const TAG_ROLE_UPDATED: u8 = 6;
pub(crate) const TAG_ROLE_REMOVED: u8 = 7;

/// Event carrying enough context to resolve which realm cache keys are stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationEvent {
    RealmUpdated {
        realm_id: String,
        realm_name: String,
    },
    RealmRemoved {
        realm_id: String,
        realm_name: String,
    },
    GroupAdded {
        group_id: String,
        realm_id: String,
        parent_id: Option<String>,
    },
    GroupRemoved {
        group_id: String,
        realm_id: String,
        parent_id: Option<String>,
    },
    RoleAdded {
        role_id: String,
        container_id: String,
    },
    RoleUpdated {
        role_id: String,
        role_name: String,
        container_id: String,
    },
    RoleRemoved {
        role_id: String,
        role_name: String,
        container_id: String,
    },
}

impl InvalidationEvent {
    /// Id of the object the event is about; always invalidated itself.
    pub fn id(&self) -> &str {
        match self {
            InvalidationEvent::RealmUpdated { realm_id, .. }
            | InvalidationEvent::RealmRemoved { realm_id, .. } => realm_id,
            InvalidationEvent::GroupAdded { group_id, .. }
            | InvalidationEvent::GroupRemoved { group_id, .. } => group_id,
            InvalidationEvent::RoleAdded { role_id, .. }
            | InvalidationEvent::RoleUpdated { role_id, .. }
            | InvalidationEvent::RoleRemoved { role_id, .. } => role_id,
        }
    }

    /// Adds the realm cache keys made stale by this event.
    pub fn add_invalidations(
        &self,
        realm_cache: &RealmCacheManager,
        invalidations: &mut HashSet<String>,
    ) {
        match self {
            InvalidationEvent::RealmUpdated { realm_id, realm_name } => {
                realm_cache.realm_updated(realm_id, realm_name, invalidations)
            }
            InvalidationEvent::RealmRemoved { realm_id, realm_name } => {
                realm_cache.realm_removal(realm_id, realm_name, invalidations)
            }
            InvalidationEvent::GroupAdded { realm_id, parent_id, .. }
            | InvalidationEvent::GroupRemoved { realm_id, parent_id, .. } => {
                realm_cache.group_queries_invalidations(realm_id, invalidations);
                if let Some(parent_id) = parent_id {
                    invalidations.insert(parent_id.clone());
                }
            }
            InvalidationEvent::RoleAdded { container_id, .. } => {
                realm_cache.role_added(container_id, invalidations)
            }
            InvalidationEvent::RoleUpdated { role_name, container_id, .. } => {
                realm_cache.role_updated(container_id, role_name, invalidations)
            }
            InvalidationEvent::RoleRemoved { role_id, role_name, container_id } => {
                realm_cache.role_removal(role_id, role_name, container_id, invalidations)
            }
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            InvalidationEvent::RealmUpdated { .. } => "RealmUpdatedEvent",
            InvalidationEvent::RealmRemoved { .. } => "RealmRemovedEvent",
            InvalidationEvent::GroupAdded { .. } => "GroupAddedEvent",
            InvalidationEvent::GroupRemoved { .. } => "GroupRemovedEvent",
            InvalidationEvent::RoleAdded { .. } => "RoleAddedEvent",
            InvalidationEvent::RoleUpdated { .. } => "RoleUpdatedEvent",
            InvalidationEvent::RoleRemoved { .. } => "RoleRemovedEvent",
        }
    }

    pub(crate) fn is_tag(tag: u8) -> bool {
        (TAG_REALM_UPDATED..=TAG_ROLE_REMOVED).contains(&tag)
    }

    // == Encoding ==
    /// Writes the event at its current wire version.
    pub fn encode(&self, writer: &mut WireWriter) {
        match self {
            InvalidationEvent::RealmUpdated { realm_id, realm_name } => {
                writer
                    .put_u8(TAG_REALM_UPDATED)
                    .put_u8(VERSION_1)
                    .put_string(realm_id)
                    .put_string(realm_name);
            }
            InvalidationEvent::RealmRemoved { realm_id, realm_name } => {
                writer
                    .put_u8(TAG_REALM_REMOVED)
                    .put_u8(VERSION_1)
                    .put_string(realm_id)
                    .put_string(realm_name);
            }
            InvalidationEvent::GroupAdded { group_id, realm_id, parent_id } => {
                writer
                    .put_u8(TAG_GROUP_ADDED)
                    .put_u8(VERSION_2)
                    .put_string(group_id)
                    .put_string(realm_id)
                    .put_opt_string(parent_id.as_deref());
            }
            InvalidationEvent::GroupRemoved { group_id, realm_id, parent_id } => {
                writer
                    .put_u8(TAG_GROUP_REMOVED)
                    .put_u8(VERSION_1)
                    .put_string(group_id)
                    .put_opt_string(parent_id.as_deref())
                    .put_string(realm_id);
            }
            InvalidationEvent::RoleAdded { role_id, container_id } => {
                writer
                    .put_u8(TAG_ROLE_ADDED)
                    .put_u8(VERSION_1)
                    .put_string(role_id)
                    .put_string(container_id);
            }
            InvalidationEvent::RoleUpdated { role_id, role_name, container_id } => {
                writer
                    .put_u8(TAG_ROLE_UPDATED)
                    .put_u8(VERSION_1)
                    .put_string(role_id)
                    .put_string(role_name)
                    .put_string(container_id);
            }
            InvalidationEvent::RoleRemoved { role_id, role_name, container_id } => {
                writer
                    .put_u8(TAG_ROLE_REMOVED)
                    .put_u8(VERSION_1)
                    .put_string(role_id)
                    .put_string(role_name)
                    .put_string(container_id);
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut writer = WireWriter::new();
        self.encode(&mut writer);
        writer.finish()
    }

    // == Decoding ==
    /// Reads one event; unknown tags and versions are errors.
    pub fn decode(reader: &mut WireReader) -> Result<Self, WireError> {
        let tag = reader.get_u8("type")?;
        let version = reader.get_u8("version")?;

        let event = match tag {
            TAG_REALM_UPDATED => {
                expect_version("RealmUpdatedEvent", version, VERSION_1)?;
                InvalidationEvent::RealmUpdated {
                    realm_id: reader.get_string("realmId")?,
                    realm_name: reader.get_string("realmName")?,
                }
            }
            TAG_REALM_REMOVED => {
                expect_version("RealmRemovedEvent", version, VERSION_1)?;
                InvalidationEvent::RealmRemoved {
                    realm_id: reader.get_string("realmId")?,
                    realm_name: reader.get_string("realmName")?,
                }
            }
            TAG_GROUP_ADDED => match version {
                VERSION_1 => InvalidationEvent::GroupAdded {
                    group_id: reader.get_string("groupId")?,
                    realm_id: reader.get_string("realmId")?,
                    parent_id: None,
                },
                VERSION_2 => InvalidationEvent::GroupAdded {
                    group_id: reader.get_string("groupId")?,
                    realm_id: reader.get_string("realmId")?,
                    parent_id: reader.get_opt_string("parentId")?,
                },
                other => {
                    return Err(WireError::UnknownVersion {
                        event: "GroupAddedEvent",
                        version: other,
                    })
                }
            },
            TAG_GROUP_REMOVED => {
                expect_version("GroupRemovedEvent", version, VERSION_1)?;
                let group_id = reader.get_string("groupId")?;
                let parent_id = reader.get_opt_string("parentId")?;
                let realm_id = reader.get_string("realmId")?;
                InvalidationEvent::GroupRemoved { group_id, realm_id, parent_id }
            }
            TAG_ROLE_ADDED => {
                expect_version("RoleAddedEvent", version, VERSION_1)?;
                InvalidationEvent::RoleAdded {
                    role_id: reader.get_string("roleId")?,
                    container_id: reader.get_string("containerId")?,
                }
            }
            TAG_ROLE_UPDATED => {
                expect_version("RoleUpdatedEvent", version, VERSION_1)?;
                InvalidationEvent::RoleUpdated {
                    role_id: reader.get_string("roleId")?,
                    role_name: reader.get_string("roleName")?,
                    container_id: reader.get_string("containerId")?,
                }
            }
            TAG_ROLE_REMOVED => {
                expect_version("RoleRemovedEvent", version, VERSION_1)?;
                InvalidationEvent::RoleRemoved {
                    role_id: reader.get_string("roleId")?,
                    role_name: reader.get_string("roleName")?,
                    container_id: reader.get_string("containerId")?,
                }
            }
            other => return Err(WireError::UnknownEventType(other)),
        };
        Ok(event)
    }
}

fn expect_version(event: &'static str, version: u8, supported: u8) -> Result<(), WireError> {
    if version == supported {
        Ok(())
    } else {
        Err(WireError::UnknownVersion { event, version })
    }
}

impl fmt::Display for InvalidationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.type_name();
        match self {
            InvalidationEvent::RealmUpdated { realm_id, realm_name }
            | InvalidationEvent::RealmRemoved { realm_id, realm_name } => {
                write!(f, "{} [ realmId={}, realmName={} ]", name, realm_id, realm_name)
            }
            InvalidationEvent::GroupAdded { group_id, realm_id, .. }
            | InvalidationEvent::GroupRemoved { group_id, realm_id, .. } => {
                write!(f, "{} [ realmId={}, groupId={} ]", name, realm_id, group_id)
            }
            InvalidationEvent::RoleAdded { role_id, container_id } => {
                write!(f, "{} [ roleId={}, containerId={} ]", name, role_id, container_id)
            }
            InvalidationEvent::RoleUpdated { role_id, role_name, container_id }
            | InvalidationEvent::RoleRemoved { role_id, role_name, container_id } => write!(
                f,
                "{} [ roleId={}, roleName={}, containerId={} ]",
                name, role_id, role_name, container_id
            ),
        }
    }
}
