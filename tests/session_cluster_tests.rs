//! Cluster Integration Tests
//!
//! Drives several in-memory nodes connected through one cluster hub and,
//! where needed, one shared remote store.

use std::sync::Arc;

use realm_session_cache::cluster::{InMemoryCluster, InvalidationEvent};
use realm_session_cache::cluster::{CachedObject, RealmCacheManager};
use realm_session_cache::clock::ManualClock;
use realm_session_cache::models::{ClientModel, InMemoryDirectory, RealmModel, UserModel};
use realm_session_cache::models::UserSessionEntity;
use realm_session_cache::remote::{
    InMemoryRemoteStore, RemoteCacheInvoker, RemoteEventHandler, RetryPolicy,
};
use realm_session_cache::sessions::{
    InMemoryUserSessionPersister, RemoteListener, SessionFilter, UserSessionPersister,
    USER_SESSIONS,
};
use realm_session_cache::{Config, NewUserSession, SessionCaches};

// == Test Helpers ==
const NOW: i64 = 1_000_000;

fn directory() -> Arc<InMemoryDirectory> {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.add_realm(RealmModel::new("r1", "acme"));
    directory.add_client(ClientModel::new("c1", "portal", "r1"));
    directory.add_client(ClientModel::new("c2", "admin", "r1"));
    directory.add_user(UserModel::new("u1", "r1", "alice"));
    directory
}

fn realm() -> RealmModel {
    RealmModel::new("r1", "acme")
}

fn client(id: &str) -> ClientModel {
    ClientModel::new(id, id, "r1")
}

fn node(
    hub: &Arc<InMemoryCluster>,
    name: &str,
    site: Option<&str>,
    clock: &Arc<ManualClock>,
) -> Arc<SessionCaches> {
    SessionCaches::builder(Config::default())
        .clock(clock.clone())
        .directory(directory())
        .cluster(hub.join(name, site.map(str::to_string)))
        .build()
        .unwrap()
}

fn remote_node(
    hub: &Arc<InMemoryCluster>,
    name: &str,
    site: &str,
    clock: &Arc<ManualClock>,
    remote: &Arc<InMemoryRemoteStore>,
) -> Arc<SessionCaches> {
    let config = Config {
        remote_store_enabled: true,
        ..Config::default()
    };
    SessionCaches::builder(config)
        .clock(clock.clone())
        .directory(directory())
        .cluster(hub.join(name, Some(site.to_string())))
        .remote_store(USER_SESSIONS, remote.clone())
        .build()
        .unwrap()
}

fn remote_session(remote: &Arc<InMemoryRemoteStore>, id: &str) -> (UserSessionEntity, u64) {
    RemoteCacheInvoker::new(remote.clone(), RetryPolicy::immediate(1), 1)
        .get::<UserSessionEntity>(id)
        .unwrap()
        .unwrap()
}

fn new_session(id: &str) -> NewUserSession {
    NewUserSession {
        id: Some(id.to_string()),
        ..NewUserSession::new("r1", "u1", "alice")
    }
}

fn create_session(caches: &Arc<SessionCaches>, id: &str) {
    let mut provider = caches.provider();
    let session = provider.create_user_session(new_session(id)).unwrap();
    provider.create_client_session(&realm(), &client("c1"), &session).unwrap();
    provider.commit().unwrap();
}

/// Applies every pending remote notification synchronously.
fn drain(listener: &mut RemoteListener) -> usize {
    let (handler, events) = listener;
    let mut applied = 0;
    while let Ok(event) = events.try_recv() {
        handler.handle(&event);
        applied += 1;
    }
    applied
}

// == Realm Removal ==
#[test]
fn test_realm_removed_clears_sessions_on_every_node_and_site() {
    let clock = Arc::new(ManualClock::at_secs(NOW));
    let hub = InMemoryCluster::new();
    let a1 = node(&hub, "a1", Some("site-a"), &clock);
    let a2 = node(&hub, "a2", Some("site-a"), &clock);
    let b1 = node(&hub, "b1", Some("site-b"), &clock);

    for caches in [&a1, &a2, &b1] {
        create_session(caches, "s1");
        assert_eq!(caches.user_sessions(false).store().len(), 1);
    }

    let mut provider = a1.provider();
    provider.on_realm_removed("r1").unwrap();
    provider.commit().unwrap();

    for caches in [&a1, &a2, &b1] {
        assert!(caches.user_sessions(false).store().is_empty());
        assert!(caches.client_sessions(false).store().is_empty());
    }
}

#[test]
fn test_remove_all_user_sessions_stays_in_local_site_for_other_realms() {
    let clock = Arc::new(ManualClock::at_secs(NOW));
    let hub = InMemoryCluster::new();
    let a1 = node(&hub, "a1", None, &clock);
    let a2 = node(&hub, "a2", None, &clock);
    create_session(&a1, "s1");
    create_session(&a2, "s2");

    let mut provider = a2.provider();
    provider.remove_all_user_sessions(&RealmModel::new("other", "other"));
    provider.commit().unwrap();
    assert_eq!(a1.user_sessions(false).store().len(), 1);

    let mut provider = a2.provider();
    provider.remove_all_user_sessions(&realm());
    provider.commit().unwrap();
    assert!(a1.user_sessions(false).store().is_empty());
    assert!(a2.user_sessions(false).store().is_empty());
}

// == Cascade ==
#[test]
fn test_removing_user_session_removes_every_client_session() {
    let clock = Arc::new(ManualClock::at_secs(NOW));
    let hub = InMemoryCluster::new();
    let caches = node(&hub, "a1", None, &clock);

    let mut provider = caches.provider();
    let session = provider.create_user_session(new_session("s1")).unwrap();
    provider.create_client_session(&realm(), &client("c1"), &session).unwrap();
    provider.create_client_session(&realm(), &client("c2"), &session).unwrap();
    provider.commit().unwrap();
    assert_eq!(caches.client_sessions(false).store().len(), 2);

    let mut provider = caches.provider();
    let session = provider.get_user_session(&realm(), "s1").unwrap();
    assert_eq!(session.client_session_ids().len(), 2);
    provider.remove_user_session(&realm(), &session).unwrap();
    provider.commit().unwrap();

    assert!(caches.user_sessions(false).store().is_empty());
    assert!(caches.client_sessions(false).store().is_empty());
}

// == Import ==
#[test]
fn test_offline_sessions_survive_a_node_restart() {
    let clock = Arc::new(ManualClock::at_secs(NOW));
    let hub = InMemoryCluster::new();
    let persister = Arc::new(InMemoryUserSessionPersister::new(clock.clone()));
    let build = |name: &str| {
        SessionCaches::builder(Config::default())
            .clock(clock.clone())
            .directory(directory())
            .cluster(hub.join(name, None))
            .persister(persister.clone())
            .build()
            .unwrap()
    };

    let first = build("a1");
    let mut provider = first.provider();
    let online = provider.create_user_session(new_session("s1")).unwrap();
    let online_client = provider.create_client_session(&realm(), &client("c1"), &online).unwrap();
    let offline = provider.create_offline_user_session(&online).unwrap();
    let offline_client = provider
        .create_offline_client_session(&online_client, &offline)
        .unwrap();
    provider.set_user_session_note(&offline, "origin", "first").unwrap();
    provider.commit().unwrap();

    let restarted = build("a2");
    let mut provider = restarted.provider();
    let recovered = provider.get_offline_user_session(&realm(), "s1").unwrap();
    assert_eq!(recovered.user_id(), "u1");
    assert_eq!(recovered.client_session_id("c1"), Some(offline_client.id()));

    let recovered_client = provider
        .get_client_session(&recovered, "c1", offline_client.id(), true)
        .unwrap();
    assert_eq!(recovered_client.client_id(), "c1");
    assert_eq!(provider.get_offline_sessions_count(&realm(), "c1").unwrap(), 1);
}

#[test]
fn test_bulk_import_skips_expired_sessions() {
    let clock = Arc::new(ManualClock::at_secs(NOW));
    let hub = InMemoryCluster::new();
    let persister = Arc::new(InMemoryUserSessionPersister::new(clock.clone()));
    let source = SessionCaches::builder(Config::default())
        .clock(clock.clone())
        .directory(directory())
        .cluster(hub.join("a1", None))
        .persister(persister.clone())
        .build()
        .unwrap();

    let mut provider = source.provider();
    let online = provider.create_user_session(new_session("s1")).unwrap();
    provider.create_offline_user_session(&online).unwrap();
    provider.commit().unwrap();

    let loaded = persister
        .load_user_sessions(&realm(), SessionFilter::User("u1"), true, 0, None)
        .unwrap();
    assert_eq!(loaded.len(), 1);

    let fresh = node(&hub, "a2", None, &clock);
    assert_eq!(fresh.import_user_sessions(loaded.clone(), true).unwrap(), 1);
    assert!(fresh.user_sessions(true).store().contains_key(&"s1".to_string()));

    // default offline idle timeout is 30 days, plus the grace window
    clock.advance_secs(2_592_000 + 121);
    let late = node(&hub, "a3", None, &clock);
    assert_eq!(late.import_user_sessions(loaded, true).unwrap(), 0);
    assert!(late.user_sessions(true).store().is_empty());
}

// == Remote Store ==
#[test]
fn test_concurrent_updates_from_two_sites_are_both_kept() {
    let clock = Arc::new(ManualClock::at_secs(NOW));
    let hub = InMemoryCluster::new();
    let remote = Arc::new(InMemoryRemoteStore::new(USER_SESSIONS, clock.clone()));
    let site_a = remote_node(&hub, "a1", "site-a", &clock, &remote);
    let site_b = remote_node(&hub, "b1", "site-b", &clock, &remote);
    let mut listeners_a = site_a.remote_listeners();
    let mut listeners_b = site_b.remote_listeners();
    assert_eq!(listeners_a.len(), 1);

    let mut provider = site_a.provider();
    provider.create_user_session(new_session("s1")).unwrap();
    provider.commit().unwrap();
    drain(&mut listeners_a[0]);
    drain(&mut listeners_b[0]);
    assert!(site_b.user_sessions(false).store().contains_key(&"s1".to_string()));

    // Site A starts a request, then site B commits first
    let mut slow = site_a.provider();
    let seen_by_a = slow.get_user_session(&realm(), "s1").unwrap();
    slow.set_user_session_note(&seen_by_a, "from_a", "1").unwrap();

    let mut fast = site_b.provider();
    let seen_by_b = fast.get_user_session(&realm(), "s1").unwrap();
    fast.set_user_session_note(&seen_by_b, "from_b", "1").unwrap();
    fast.commit().unwrap();

    drain(&mut listeners_a[0]);
    slow.commit().unwrap();
    drain(&mut listeners_b[0]);

    for caches in [&site_a, &site_b] {
        let session = caches.provider().get_user_session(&realm(), "s1").unwrap();
        assert_eq!(session.note("from_a"), Some("1"));
        assert_eq!(session.note("from_b"), Some("1"));
    }

    let (stored, _) = remote_session(&remote, "s1");
    assert_eq!(stored.notes.len(), 2);
}

#[test]
fn test_remote_create_arriving_before_local_commit_is_not_lost() {
    let clock = Arc::new(ManualClock::at_secs(NOW));
    let hub = InMemoryCluster::new();
    let remote = Arc::new(InMemoryRemoteStore::new(USER_SESSIONS, clock.clone()));
    let site_a = remote_node(&hub, "a1", "site-a", &clock, &remote);
    let site_b = remote_node(&hub, "b1", "site-b", &clock, &remote);
    let mut listeners_a = site_a.remote_listeners();
    let mut listeners_b = site_b.remote_listeners();

    // Site A creates the session but has not committed yet
    let mut slow = site_a.provider();
    let pending = slow
        .create_user_session(NewUserSession {
            ip_address: Some("10.0.0.1".into()),
            ..new_session("s1")
        })
        .unwrap();
    slow.set_user_session_note(&pending, "from_a", "1").unwrap();

    let mut fast = site_b.provider();
    fast.create_user_session(NewUserSession {
        ip_address: Some("10.0.0.2".into()),
        ..new_session("s1")
    })
    .unwrap();
    fast.commit().unwrap();
    let (_, created_version) = remote_session(&remote, "s1");

    assert!(drain(&mut listeners_a[0]) > 0);
    let imported = site_a.user_sessions(false).store().peek(&"s1".to_string()).unwrap();
    assert_eq!(imported.entity().ip_address.as_deref(), Some("10.0.0.2"));

    slow.commit().unwrap();
    drain(&mut listeners_a[0]);
    drain(&mut listeners_b[0]);

    for caches in [&site_a, &site_b] {
        let session = caches.provider().get_user_session(&realm(), "s1").unwrap();
        assert_eq!(session.entity().ip_address.as_deref(), Some("10.0.0.2"));
        assert_eq!(session.note("from_a"), Some("1"));
    }

    let (stored, version) = remote_session(&remote, "s1");
    assert!(version > created_version);
    assert_eq!(stored.ip_address.as_deref(), Some("10.0.0.2"));
    assert_eq!(stored.notes.get("from_a").map(String::as_str), Some("1"));
}

// == Realm Cache Invalidation ==
#[test]
fn test_invalidation_reaches_other_nodes_after_commit() {
    let clock = Arc::new(ManualClock::at_secs(NOW));
    let hub = InMemoryCluster::new();
    let a1 = node(&hub, "a1", None, &clock);
    let a2 = node(&hub, "a2", None, &clock);

    for caches in [&a1, &a2] {
        caches.realm_cache().put(
            "r1",
            CachedObject::Realm {
                id: "r1".into(),
                name: "acme".into(),
            },
        );
        caches.realm_cache().put(
            RealmCacheManager::realm_by_name_key("acme"),
            CachedObject::Realm {
                id: "r1".into(),
                name: "acme".into(),
            },
        );
    }

    let mut tx = a1.invalidations().transaction();
    tx.add(InvalidationEvent::RealmUpdated {
        realm_id: "r1".into(),
        realm_name: "acme".into(),
    });
    assert_eq!(a2.realm_cache().len(), 2);
    tx.commit().unwrap();

    assert!(a1.realm_cache().is_empty());
    assert!(a2.realm_cache().is_empty());
}
