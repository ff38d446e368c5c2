//! Realm cache
//!
//! Node-local cache of realm metadata and query results (realm by name, role
//! lists, group lists). Invalidation events resolve to sets of keys of this
//! cache; evicting them is always local.

use std::collections::HashSet;
use std::sync::Arc;

use crate::cache::{CacheStats, EntityStore, Expiration, SessionEntityWrapper};
use crate::cluster::InvalidationEvent;
use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    RealmByName,
    Roles,
    RoleByName,
    Groups,
    TopGroups,
}

/// Cached realm metadata or query result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedObject {
    Realm {
        id: String,
        name: String,
    },
    Role {
        id: String,
        name: String,
        /// Realm or client owning the role
        container_id: String,
        realm_id: String,
        composites: Vec<String>,
    },
    Group {
        id: String,
        realm_id: String,
        parent_id: Option<String>,
        role_mappings: Vec<String>,
    },
    Query {
        kind: QueryKind,
        realm_id: String,
        /// Ids of the matching objects
        ids: Vec<String>,
    },
}

impl CachedObject {
    fn realm_id(&self) -> &str {
        match self {
            CachedObject::Realm { id, .. } => id,
            CachedObject::Role { realm_id, .. }
            | CachedObject::Group { realm_id, .. }
            | CachedObject::Query { realm_id, .. } => realm_id,
        }
    }

    fn has_role(&self, role_id: &str) -> bool {
        match self {
            CachedObject::Role { composites, .. } => composites.iter().any(|id| id == role_id),
            CachedObject::Group { role_mappings, .. } => {
                role_mappings.iter().any(|id| id == role_id)
            }
            _ => false,
        }
    }

    fn is_group_list_in(&self, realm: &str) -> bool {
        matches!(
            self,
            CachedObject::Query { kind: QueryKind::Groups | QueryKind::TopGroups, realm_id, .. }
                if realm_id == realm
        )
    }
}

// == Realm Cache Manager ==
#[derive(Debug)]
pub struct RealmCacheManager {
    cache: EntityStore<String, CachedObject>,
}

impl RealmCacheManager {
    pub fn new(max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache: EntityStore::new("realms", max_entries, clock),
        }
    }

    // == Keys ==
    pub fn realm_by_name_key(name: &str) -> String {
        format!("realm.query.by.name.{}", name)
    }

    pub fn roles_key(container_id: &str) -> String {
        format!("{}.roles", container_id)
    }

    pub fn role_by_name_key(container_id: &str, name: &str) -> String {
        format!("{}.{}.roles", container_id, name)
    }

    pub fn groups_key(realm_id: &str) -> String {
        format!("{}.groups", realm_id)
    }

    pub fn top_groups_key(realm_id: &str) -> String {
        format!("{}.top.groups", realm_id)
    }

    // == Access ==
    pub fn put(&self, key: impl Into<String>, object: CachedObject) {
        self.cache
            .put(key.into(), SessionEntityWrapper::new(object), Expiration::immortal());
    }

    pub fn get(&self, key: &str) -> Option<CachedObject> {
        self.cache
            .get(&key.to_string())
            .map(SessionEntityWrapper::into_entity)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.cache.contains_key(&key.to_string())
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Evicts one key locally; true if something was cached under it.
    pub fn invalidate_object(&self, key: &str) -> bool {
        self.cache.remove(&key.to_string()).is_some()
    }

    /// Keys an event invalidates: its own id plus whatever the event adds.
    pub fn invalidations_for(&self, event: &InvalidationEvent) -> HashSet<String> {
        let mut invalidations = HashSet::new();
        invalidations.insert(event.id().to_string());
        event.add_invalidations(self, &mut invalidations);
        invalidations
    }

    // == Invalidation Rules ==
    pub fn realm_updated(&self, id: &str, name: &str, invalidations: &mut HashSet<String>) {
        invalidations.insert(id.to_string());
        invalidations.insert(Self::realm_by_name_key(name));
    }

    pub fn realm_removal(&self, id: &str, name: &str, invalidations: &mut HashSet<String>) {
        invalidations.insert(id.to_string());
        invalidations.insert(Self::realm_by_name_key(name));
        self.add_invalidations(|object| object.realm_id() == id, invalidations);
    }

    pub fn role_added(&self, container_id: &str, invalidations: &mut HashSet<String>) {
        invalidations.insert(Self::roles_key(container_id));
    }

    pub fn role_updated(
        &self,
        container_id: &str,
        name: &str,
        invalidations: &mut HashSet<String>,
    ) {
        invalidations.insert(Self::role_by_name_key(container_id, name));
    }

    pub fn role_removal(
        &self,
        id: &str,
        name: &str,
        container_id: &str,
        invalidations: &mut HashSet<String>,
    ) {
        invalidations.insert(Self::roles_key(container_id));
        invalidations.insert(Self::role_by_name_key(container_id, name));
        self.add_invalidations(|object| object.has_role(id), invalidations);
    }

    pub fn group_queries_invalidations(&self, realm_id: &str, invalidations: &mut HashSet<String>) {
        invalidations.insert(Self::groups_key(realm_id));
        invalidations.insert(Self::top_groups_key(realm_id));
        self.add_invalidations(|object| object.is_group_list_in(realm_id), invalidations);
    }

    /// Adds the keys of every cached object matching `predicate`.
    fn add_invalidations<F>(&self, predicate: F, invalidations: &mut HashSet<String>)
    where
        F: Fn(&CachedObject) -> bool,
    {
        invalidations.extend(self.cache.keys_where(|_, object| predicate(object)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn manager() -> RealmCacheManager {
        RealmCacheManager::new(0, Arc::new(ManualClock::at_secs(0)))
    }

    fn role(id: &str, container: &str, composites: &[&str]) -> CachedObject {
        CachedObject::Role {
            id: id.into(),
            name: format!("{}-name", id),
            container_id: container.into(),
            realm_id: "r1".into(),
            composites: composites.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[test]
    fn test_key_formats() {
        assert_eq!(RealmCacheManager::realm_by_name_key("acme"), "realm.query.by.name.acme");
        assert_eq!(RealmCacheManager::roles_key("r1"), "r1.roles");
        assert_eq!(RealmCacheManager::role_by_name_key("r1", "admin"), "r1.admin.roles");
        assert_eq!(RealmCacheManager::groups_key("r1"), "r1.groups");
        assert_eq!(RealmCacheManager::top_groups_key("r1"), "r1.top.groups");
    }

    #[test]
    fn test_realm_removal_collects_everything_in_realm() {
        let manager = manager();
        manager.put("r1", CachedObject::Realm { id: "r1".into(), name: "acme".into() });
        manager.put("role-1", role("role-1", "r1", &[]));
        manager.put(
            "other",
            CachedObject::Realm { id: "r2".into(), name: "other".into() },
        );

        let mut invalidations = HashSet::new();
        manager.realm_removal("r1", "acme", &mut invalidations);

        assert!(invalidations.contains("r1"));
        assert!(invalidations.contains("role-1"));
        assert!(invalidations.contains("realm.query.by.name.acme"));
        assert!(!invalidations.contains("other"));
    }

    #[test]
    fn test_role_removal_includes_holders_of_the_role() {
        let manager = manager();
        manager.put("composite", role("composite", "r1", &["removed"]));
        manager.put(
            "group-1",
            CachedObject::Group {
                id: "group-1".into(),
                realm_id: "r1".into(),
                parent_id: None,
                role_mappings: vec!["removed".into()],
            },
        );
        manager.put("unrelated", role("unrelated", "r1", &[]));

        let mut invalidations = HashSet::new();
        manager.role_removal("removed", "admin", "r1", &mut invalidations);

        assert!(invalidations.contains("composite"));
        assert!(invalidations.contains("group-1"));
        assert!(invalidations.contains("r1.roles"));
        assert!(invalidations.contains("r1.admin.roles"));
        assert!(!invalidations.contains("unrelated"));
    }

    #[test]
    fn test_group_queries_invalidations_match_group_lists() {
        let manager = manager();
        manager.put(
            "r1.groups.search.dev",
            CachedObject::Query {
                kind: QueryKind::Groups,
                realm_id: "r1".into(),
                ids: vec!["g1".into()],
            },
        );

        let mut invalidations = HashSet::new();
        manager.group_queries_invalidations("r1", &mut invalidations);

        assert!(invalidations.contains("r1.groups"));
        assert!(invalidations.contains("r1.top.groups"));
        assert!(invalidations.contains("r1.groups.search.dev"));
    }

    #[test]
    fn test_invalidate_object_is_idempotent() {
        let manager = manager();
        manager.put("r1", CachedObject::Realm { id: "r1".into(), name: "acme".into() });

        assert!(manager.invalidate_object("r1"));
        assert!(!manager.invalidate_object("r1"));
        assert!(manager.get("r1").is_none());
    }
}
