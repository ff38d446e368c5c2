//! Session Region
//!
//! Binds an `EntityStore` to the expiration policy of the entities it holds
//! and, when cross-site replication is configured, to the remote store that
//! mirrors it.

use std::sync::Arc;

use tracing::trace;

use crate::cache::{CacheKey, EntityStore, EntryTtl, Expiration};
use crate::models::{ClientModel, ModelDirectory, RealmModel, SessionEntity};
use crate::remote::RemoteCacheInvoker;

/// Computes a lifespan or max-idle TTL for an entity at `now` (Unix seconds).
pub type SessionFunction<V> =
    Arc<dyn Fn(&RealmModel, Option<&ClientModel>, &V, i64) -> EntryTtl + Send + Sync>;

// == Session Region ==
pub struct SessionRegion<K, V> {
    store: Arc<EntityStore<K, V>>,
    remote: Option<Arc<RemoteCacheInvoker>>,
    lifespan: SessionFunction<V>,
    max_idle: SessionFunction<V>,
    directory: Arc<dyn ModelDirectory>,
}

impl<K, V> Clone for SessionRegion<K, V> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            remote: self.remote.clone(),
            lifespan: self.lifespan.clone(),
            max_idle: self.max_idle.clone(),
            directory: self.directory.clone(),
        }
    }
}

impl<K: CacheKey, V: SessionEntity> SessionRegion<K, V> {
    pub fn new(
        store: Arc<EntityStore<K, V>>,
        lifespan: SessionFunction<V>,
        max_idle: SessionFunction<V>,
        directory: Arc<dyn ModelDirectory>,
    ) -> Self {
        Self {
            store,
            remote: None,
            lifespan,
            max_idle,
            directory,
        }
    }

    /// Mirrors committed writes of this region to a remote store.
    pub fn with_remote(mut self, invoker: Arc<RemoteCacheInvoker>) -> Self {
        self.remote = Some(invoker);
        self
    }

    pub fn store(&self) -> &Arc<EntityStore<K, V>> {
        &self.store
    }

    pub fn remote(&self) -> Option<&Arc<RemoteCacheInvoker>> {
        self.remote.as_ref()
    }

    pub fn directory(&self) -> &Arc<dyn ModelDirectory> {
        &self.directory
    }

    pub fn name(&self) -> &str {
        self.store.name()
    }

    // == Expiration ==
    /// Lifespan and max-idle for writing `entity` now.
    ///
    /// An entity whose realm no longer exists is treated as expired.
    pub fn expiration_for(&self, entity: &V) -> Expiration {
        let Some(realm) = self.directory.realm(entity.realm_id()) else {
            trace!(
                region = %self.name(),
                realm = %entity.realm_id(),
                "realm not found, entry treated as expired",
            );
            return Expiration::new(EntryTtl::Expired, EntryTtl::Expired);
        };
        let client = entity
            .client_id()
            .and_then(|client_id| self.directory.client(&realm.id, client_id));
        let now = self.store.clock().now_secs();

        let expiration = Expiration::new(
            (self.lifespan)(&realm, client.as_ref(), entity, now),
            (self.max_idle)(&realm, client.as_ref(), entity, now),
        );
        trace!(region = %self.name(), ?expiration, "computed entry expiration");
        expiration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{InMemoryDirectory, UserSessionEntity};

    fn region(directory: Arc<InMemoryDirectory>) -> SessionRegion<String, UserSessionEntity> {
        let clock = Arc::new(ManualClock::at_secs(1_000));
        let store = Arc::new(EntityStore::new("sessions", 0, clock));
        SessionRegion::new(
            store,
            Arc::new(
                |realm: &RealmModel,
                 _: Option<&ClientModel>,
                 entity: &UserSessionEntity,
                 now: i64| {
                    EntryTtl::from_remaining_secs(
                        entity.started + realm.sso_session_max_lifespan - now,
                    )
                },
            ),
            Arc::new(|_: &RealmModel, _: Option<&ClientModel>, _: &UserSessionEntity, _: i64| {
                EntryTtl::Immortal
            }),
            directory,
        )
    }

    #[test]
    fn test_expiration_uses_realm_policy() {
        let directory = Arc::new(InMemoryDirectory::new());
        let mut realm = RealmModel::new("r1", "acme");
        realm.sso_session_max_lifespan = 100;
        directory.add_realm(realm);

        let region = region(directory);
        let mut entity = UserSessionEntity::new("s1", "r1", "u1");
        entity.started = 950;

        let expiration = region.expiration_for(&entity);

        assert_eq!(expiration.lifespan, EntryTtl::Millis(50_000));
        assert_eq!(expiration.max_idle, EntryTtl::Immortal);
    }

    #[test]
    fn test_missing_realm_is_expired() {
        let region = region(Arc::new(InMemoryDirectory::new()));
        let entity = UserSessionEntity::new("s1", "gone", "u1");

        assert!(region.expiration_for(&entity).is_expired());
        assert!(region.remote().is_none());
    }
}
