//! Remote store listener
//!
//! Applies change notifications from the remote store to the local region.
//! Writes made here never go back to the remote store. Only the primary owner
//! of a key applies its notification, unless the remote store retried the
//! command.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::cache::{CacheKey, SessionEntityWrapper, SessionRegion};
use crate::error::Result;
use crate::models::SessionEntity;
use crate::remote::{
    RemoteCacheEvent, RemoteCacheInvoker, RemoteEventKind, RetryPolicy, TopologyInfo,
};

/// Listener tuning.
#[derive(Debug, Clone, Copy)]
pub struct ListenerSettings {
    /// Bound on merge-and-replace attempts per notification
    pub replace_retries: u32,
    /// First wait after a notification arrived before its remote write is visible
    pub premature_event_backoff: Duration,
}

impl ListenerSettings {
    /// Backoff used while the remote copy lags behind a notification; the
    /// first wait is at most `premature_event_backoff` and doubles after that.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.replace_retries, self.premature_event_backoff)
            .with_max_delay(Duration::from_secs(5))
    }
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            replace_retries: 10,
            premature_event_backoff: Duration::from_millis(25),
        }
    }
}

// == Remote Cache Session Listener ==
pub struct RemoteCacheSessionListener<K, V> {
    region: SessionRegion<K, V>,
    invoker: Arc<RemoteCacheInvoker>,
    topology: TopologyInfo,
    settings: ListenerSettings,
}

impl<K: CacheKey, V: SessionEntity> RemoteCacheSessionListener<K, V> {
    pub fn new(
        region: SessionRegion<K, V>,
        invoker: Arc<RemoteCacheInvoker>,
        topology: TopologyInfo,
        settings: ListenerSettings,
    ) -> Self {
        Self {
            region,
            invoker,
            topology,
            settings,
        }
    }

    pub fn region_name(&self) -> &str {
        self.region.name()
    }

    // == Event Dispatch ==
    /// Handles one notification. Blocks while backing off.
    pub fn on_event(&self, event: &RemoteCacheEvent) {
        if !self.should_update_local_cache(event) {
            return;
        }
        let Ok(key) = event.key.parse::<K>() else {
            warn!(
                region = %self.region_name(),
                key = %event.key,
                "Ignoring remote event with unparseable key",
            );
            return;
        };

        let outcome = match event.kind {
            RemoteEventKind::Created => self.create_remote_entity_in_cache(&key),
            RemoteEventKind::Modified => self.replace_remote_entity_in_cache(&key, event.version),
            RemoteEventKind::Removed => {
                self.removed(&key);
                Ok(())
            }
        };

        // Giving up only leaves the local copy stale until its next update
        if let Err(e) = outcome {
            warn!(
                region = %self.region_name(),
                key = %key,
                error = %e,
                "Abandoned remote event after retries"
            );
        }
    }

    // == Ownership Filter ==
    /// True if this node should apply `event` to its local region.
    pub fn should_update_local_cache(&self, event: &RemoteCacheEvent) -> bool {
        if !self.region.store().is_running() {
            return false;
        }

        let result = event.command_retried || self.topology.am_i_owner(&event.key);
        debug!(
            region = %self.region_name(),
            kind = ?event.kind,
            key = %event.key,
            skip = !result,
            "Received event from remote store"
        );
        result
    }

    // == Created ==
    pub fn create_remote_entity_in_cache(&self, key: &K) -> Result<()> {
        let Some((remote_entity, _)) = self.invoker.get::<V>(&key.to_string())? else {
            debug!(
                region = %self.region_name(),
                key = %key,
                "Entity not present in remote store, ignoring create",
            );
            return Ok(());
        };

        let expiration = self.region.expiration_for(&remote_entity);
        if expiration.is_expired() {
            trace!(
                region = %self.region_name(),
                key = %key,
                "Not calling putIfAbsent, entry already expired",
            );
            return Ok(());
        }

        trace!(
            region = %self.region_name(),
            key = %key,
            ?expiration,
            "Calling putIfAbsent for remote entity",
        );
        self.region
            .store()
            .put_if_absent(key.clone(), SessionEntityWrapper::new(remote_entity), expiration);
        Ok(())
    }

    // == Modified ==
    /// Merges the remote entity into the local one with a CAS loop.
    ///
    /// A remote copy older than `event_version` means the notification
    /// overtook the write; wait with jittered exponential backoff and retry.
    pub fn replace_remote_entity_in_cache(&self, key: &K, event_version: u64) -> Result<()> {
        let remote_key = key.to_string();
        let store = self.region.store();
        let mut backoff = self.settings.retry_policy().backoff_state();

        loop {
            let retries = backoff.attempt() + 1;

            let local = store.peek(key);
            let Some((remote_entity, remote_version)) = self.invoker.get::<V>(&remote_key)? else {
                debug!(
                    region = %self.region_name(),
                    key = %key,
                    "Entity not present in remote store, ignoring replace",
                );
                return Ok(());
            };

            if remote_version < event_version {
                debug!(
                    region = %self.region_name(),
                    key = %key,
                    event_version,
                    remote_version,
                    "Got replace event prematurely, will try again"
                );
                match backoff.next() {
                    Some(delay) => {
                        if !delay.is_zero() {
                            std::thread::sleep(delay);
                        }
                        continue;
                    }
                    None => break,
                }
            }

            let merged = remote_entity.merge_remote(local.as_ref());
            let expiration = self.region.expiration_for(merged.entity());

            let replaced = match &local {
                Some(local) => store.replace(key, local, merged, expiration),
                // Local entry missing or evicted; install the remote copy
                None if expiration.is_expired() => true,
                None => store.put_if_absent(key.clone(), merged, expiration).is_none(),
            };
            if replaced {
                return Ok(());
            }
            debug!(
                region = %self.region_name(),
                key = %key,
                retries,
                "Did not succeed in merging sessions, will try again",
            );
            // A lost CAS retries at once against the fresh local copy
            if backoff.next().is_none() {
                break;
            }
        }

        warn!(
            region = %self.region_name(),
            key = %key,
            retries = backoff.attempt(),
            "Giving up replacing local entity from remote store"
        );
        Ok(())
    }

    // == Removed ==
    pub fn removed(&self, key: &K) {
        self.region.store().remove(key);
        trace!(region = %self.region_name(), key = %key, "Removed entity on remote event");
    }
}

/// Object-safe view of a listener, driven by the background executor.
pub trait RemoteEventHandler: Send + Sync {
    fn region_name(&self) -> &str;

    fn handle(&self, event: &RemoteCacheEvent);
}

impl<K: CacheKey, V: SessionEntity> RemoteEventHandler for RemoteCacheSessionListener<K, V> {
    fn region_name(&self) -> &str {
        self.region.name()
    }

    fn handle(&self, event: &RemoteCacheEvent) {
        self.on_event(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{EntityStore, Expiration};
    use crate::changes::timeouts;
    use crate::clock::ManualClock;
    use crate::models::{InMemoryDirectory, RealmModel, UserSessionEntity};
    use crate::remote::{
        InMemoryRemoteStore, PartitionOwnership, RemoteStore, RendezvousOwnership,
    };

    struct Fixture {
        listener: RemoteCacheSessionListener<String, UserSessionEntity>,
        store: Arc<EntityStore<String, UserSessionEntity>>,
        remote: Arc<InMemoryRemoteStore>,
        invoker: Arc<RemoteCacheInvoker>,
    }

    fn fixture(topology: TopologyInfo) -> Fixture {
        let clock = Arc::new(ManualClock::at_secs(1_000));
        let directory = Arc::new(InMemoryDirectory::new());
        directory.add_realm(RealmModel::new("r1", "acme"));
        let store = Arc::new(EntityStore::new("sessions", 0, clock.clone()));
        let remote = Arc::new(InMemoryRemoteStore::new("sessions", clock));
        let invoker = Arc::new(RemoteCacheInvoker::new(
            remote.clone(),
            RetryPolicy::immediate(3),
            10,
        ));
        let region = SessionRegion::new(
            store.clone(),
            Arc::new(timeouts::user_session_lifespan),
            Arc::new(timeouts::user_session_max_idle),
            directory,
        );
        let settings = ListenerSettings {
            replace_retries: 10,
            premature_event_backoff: Duration::ZERO,
        };
        Fixture {
            listener: RemoteCacheSessionListener::new(region, invoker.clone(), topology, settings),
            store,
            remote,
            invoker,
        }
    }

    fn session(id: &str, refresh: i64) -> UserSessionEntity {
        let mut entity = UserSessionEntity::new(id, "r1", "u1");
        entity.started = 1_000;
        entity.last_session_refresh = refresh;
        entity
    }

    fn event(kind: RemoteEventKind, key: &str, version: u64) -> RemoteCacheEvent {
        RemoteCacheEvent {
            kind,
            key: key.to_string(),
            version,
            command_retried: false,
        }
    }

    #[test]
    fn test_created_event_imports_remote_entity() {
        let f = fixture(TopologyInfo::local("node-a", None));
        f.invoker.put("s1", &session("s1", 1_000), Expiration::immortal()).unwrap();

        f.listener.on_event(&event(RemoteEventKind::Created, "s1", 1));

        assert_eq!(f.store.peek(&"s1".to_string()).unwrap().entity().id, "s1");
    }

    #[test]
    fn test_created_event_skips_expired_entity() {
        let f = fixture(TopologyInfo::local("node-a", None));
        // Started long before the realm's max lifespan
        let mut expired = session("s1", 0);
        expired.started = -100_000;
        f.invoker.put("s1", &expired, Expiration::immortal()).unwrap();

        f.listener.on_event(&event(RemoteEventKind::Created, "s1", 1));

        assert!(f.store.is_empty());
    }

    #[test]
    fn test_created_event_for_missing_entity_is_ignored() {
        let f = fixture(TopologyInfo::local("node-a", None));
        f.listener.on_event(&event(RemoteEventKind::Created, "gone", 1));
        assert!(f.store.is_empty());
    }

    #[test]
    fn test_modified_event_merges_and_keeps_newer_local_refresh() {
        let f = fixture(TopologyInfo::local("node-a", None));
        let local = session("s1", 1_500);
        f.store
            .put("s1".into(), SessionEntityWrapper::new(local), Expiration::immortal());

        let mut remote = session("s1", 1_200);
        remote.notes.insert("remote".into(), "yes".into());
        f.invoker.put("s1", &remote, Expiration::immortal()).unwrap();
        let version = f.remote.get_with_version("s1").unwrap().unwrap().version;

        f.listener.on_event(&event(RemoteEventKind::Modified, "s1", version));

        let stored = f.store.peek(&"s1".to_string()).unwrap();
        assert_eq!(stored.entity().notes.get("remote").unwrap(), "yes");
        assert_eq!(stored.entity().last_session_refresh, 1_500);
    }

    #[test]
    fn test_premature_event_gives_up_after_retries() {
        let f = fixture(TopologyInfo::local("node-a", None));
        f.store
            .put(
                "s1".into(),
                SessionEntityWrapper::new(session("s1", 1_000)),
                Expiration::immortal(),
            );
        f.invoker.put("s1", &session("s1", 2_000), Expiration::immortal()).unwrap();

        // The event claims a version the remote store never reaches
        f.listener
            .replace_remote_entity_in_cache(&"s1".to_string(), 1_000)
            .unwrap();

        assert_eq!(f.store.peek(&"s1".to_string()).unwrap().entity().last_session_refresh, 1_000);
    }

    #[test]
    fn test_listener_backoff_follows_settings() {
        let settings = ListenerSettings {
            replace_retries: 3,
            premature_event_backoff: Duration::from_millis(40),
        };
        let policy = settings.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert!(policy.backoff(0) <= Duration::from_millis(40));
        assert!(policy.backoff(1) <= Duration::from_millis(80));

        let mut backoff = policy.backoff_state();
        assert!(backoff.next().is_some());
        assert!(backoff.next().is_some());
        assert!(backoff.next().is_none());
    }

    #[test]
    fn test_removed_event_removes_locally_only() {
        let f = fixture(TopologyInfo::local("node-a", None));
        f.store
            .put(
                "s1".into(),
                SessionEntityWrapper::new(session("s1", 1_000)),
                Expiration::immortal(),
            );
        f.invoker.put("s1", &session("s1", 1_000), Expiration::immortal()).unwrap();

        f.listener.on_event(&event(RemoteEventKind::Removed, "s1", 0));

        assert!(f.store.is_empty());
        assert_eq!(f.remote.len(), 1);
    }

    #[test]
    fn test_non_owner_skips_unless_retried() {
        let ownership = Arc::new(RendezvousOwnership::new(["node-a", "node-b"]));
        let key = (0..100)
            .map(|i| format!("s{}", i))
            .find(|key| ownership.primary_owner(key).as_deref() == Some("node-b"))
            .unwrap();
        let f = fixture(TopologyInfo::new("node-a", None, ownership));

        let mut evt = event(RemoteEventKind::Created, &key, 1);
        assert!(!f.listener.should_update_local_cache(&evt));

        evt.command_retried = true;
        assert!(f.listener.should_update_local_cache(&evt));
    }

    #[test]
    fn test_stopped_region_ignores_events() {
        let f = fixture(TopologyInfo::local("node-a", None));
        f.store.stop();

        let mut evt = event(RemoteEventKind::Created, "s1", 1);
        evt.command_retried = true;

        assert!(!f.listener.should_update_local_cache(&evt));
    }
}
