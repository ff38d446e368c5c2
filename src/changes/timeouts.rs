//! Session timeouts
//!
//! Lifespan and max-idle TTLs per entity kind, computed from realm and client
//! policy at the moment of the write. Idle TTLs are padded with a grace window
//! so a refresh racing the cache expiration does not lose the session.

use std::sync::Arc;

use crate::cache::{EntryTtl, SessionFunction};
use crate::models::{
    AuthenticatedClientSessionEntity, ClientModel, RealmModel, RootAuthenticationSessionEntity,
    UserSessionEntity,
};

/// Extra idle seconds granted on top of the configured idle timeout.
pub const IDLE_TIMEOUT_WINDOW_SECONDS: i64 = 120;

fn user_session_max_lifespan_secs(realm: &RealmModel, remember_me: bool) -> i64 {
    if remember_me {
        realm
            .sso_session_max_lifespan_remember_me
            .max(realm.sso_session_max_lifespan)
    } else {
        realm.sso_session_max_lifespan
    }
}

fn user_session_idle_secs(realm: &RealmModel, remember_me: bool) -> i64 {
    if remember_me {
        realm
            .sso_session_idle_timeout_remember_me
            .max(realm.sso_session_idle_timeout)
    } else {
        realm.sso_session_idle_timeout
    }
}

/// Applies a positive override as an upper bound on `inherited`.
fn bounded_by(inherited: i64, override_secs: i64) -> i64 {
    if override_secs > 0 {
        override_secs.min(inherited)
    } else {
        inherited
    }
}

fn lifespan_ttl(started: i64, max_lifespan: i64, now: i64) -> EntryTtl {
    EntryTtl::from_remaining_secs(started.saturating_add(max_lifespan).saturating_sub(now))
}

fn idle_ttl(last_refresh: i64, idle: i64, now: i64) -> EntryTtl {
    EntryTtl::from_remaining_secs(
        last_refresh
            .saturating_add(idle)
            .saturating_add(IDLE_TIMEOUT_WINDOW_SECONDS)
            .saturating_sub(now),
    )
}

// == User Sessions ==
pub fn user_session_lifespan(
    realm: &RealmModel,
    _client: Option<&ClientModel>,
    entity: &UserSessionEntity,
    now: i64,
) -> EntryTtl {
    let max_lifespan = user_session_max_lifespan_secs(realm, entity.remember_me);
    lifespan_ttl(entity.started, max_lifespan, now)
}

pub fn user_session_max_idle(
    realm: &RealmModel,
    _client: Option<&ClientModel>,
    entity: &UserSessionEntity,
    now: i64,
) -> EntryTtl {
    let idle = user_session_idle_secs(realm, entity.remember_me);
    idle_ttl(entity.last_session_refresh, idle, now)
}

/// Offline sessions never reach a lifespan unless the realm enables one.
pub fn offline_session_lifespan(
    realm: &RealmModel,
    _client: Option<&ClientModel>,
    entity: &UserSessionEntity,
    now: i64,
) -> EntryTtl {
    if !realm.offline_session_max_lifespan_enabled {
        return EntryTtl::Immortal;
    }
    lifespan_ttl(entity.started, realm.offline_session_max_lifespan, now)
}

pub fn offline_session_max_idle(
    realm: &RealmModel,
    _client: Option<&ClientModel>,
    entity: &UserSessionEntity,
    now: i64,
) -> EntryTtl {
    idle_ttl(entity.last_session_refresh, realm.offline_session_idle_timeout, now)
}

// == Client Sessions ==
/// Client sessions live at most as long as their user session; realm and
/// client settings can shorten that.
pub fn client_session_lifespan(
    realm: &RealmModel,
    client: Option<&ClientModel>,
    entity: &AuthenticatedClientSessionEntity,
    now: i64,
) -> EntryTtl {
    let mut max_lifespan =
        user_session_max_lifespan_secs(realm, entity.is_user_session_remember_me());
    max_lifespan = bounded_by(max_lifespan, realm.client_session_max_lifespan);
    if let Some(client_max) = client.and_then(|c| c.client_session_max_lifespan) {
        max_lifespan = bounded_by(max_lifespan, client_max);
    }
    lifespan_ttl(entity.user_session_started(), max_lifespan, now)
}

pub fn client_session_max_idle(
    realm: &RealmModel,
    client: Option<&ClientModel>,
    entity: &AuthenticatedClientSessionEntity,
    now: i64,
) -> EntryTtl {
    let mut idle = user_session_idle_secs(realm, entity.is_user_session_remember_me());
    idle = bounded_by(idle, realm.client_session_idle_timeout);
    if let Some(client_idle) = client.and_then(|c| c.client_session_idle_timeout) {
        idle = bounded_by(idle, client_idle);
    }
    idle_ttl(entity.timestamp, idle, now)
}

pub fn offline_client_session_lifespan(
    realm: &RealmModel,
    client: Option<&ClientModel>,
    entity: &AuthenticatedClientSessionEntity,
    now: i64,
) -> EntryTtl {
    if !realm.offline_session_max_lifespan_enabled {
        return EntryTtl::Immortal;
    }
    let mut max_lifespan = bounded_by(
        realm.offline_session_max_lifespan,
        realm.client_offline_session_max_lifespan,
    );
    if let Some(client_max) = client.and_then(|c| c.client_offline_session_max_lifespan) {
        max_lifespan = bounded_by(max_lifespan, client_max);
    }
    lifespan_ttl(entity.user_session_started(), max_lifespan, now)
}

pub fn offline_client_session_max_idle(
    realm: &RealmModel,
    client: Option<&ClientModel>,
    entity: &AuthenticatedClientSessionEntity,
    now: i64,
) -> EntryTtl {
    let mut idle = bounded_by(
        realm.offline_session_idle_timeout,
        realm.client_offline_session_idle_timeout,
    );
    if let Some(client_idle) = client.and_then(|c| c.client_offline_session_idle_timeout) {
        idle = bounded_by(idle, client_idle);
    }
    idle_ttl(entity.timestamp, idle, now)
}

// == Authentication Sessions ==
pub fn auth_session_lifespan(
    realm: &RealmModel,
    _client: Option<&ClientModel>,
    entity: &RootAuthenticationSessionEntity,
    now: i64,
) -> EntryTtl {
    lifespan_ttl(entity.timestamp, realm.access_code_lifespan_login, now)
}

pub fn immortal<V>(_: &RealmModel, _: Option<&ClientModel>, _: &V, _: i64) -> EntryTtl {
    EntryTtl::Immortal
}

// == Lifespan Override ==
/// Caps a lifespan function at `override_secs` when set.
///
/// Used for the offline regions, whose entries would otherwise stay in memory
/// for the whole offline lifespan.
pub fn with_lifespan_override<V: 'static>(
    base: SessionFunction<V>,
    override_secs: Option<i64>,
) -> SessionFunction<V> {
    let Some(override_secs) = override_secs.filter(|secs| *secs > 0) else {
        return base;
    };
    let cap = EntryTtl::Millis((override_secs as u64).saturating_mul(1000));
    Arc::new(
        move |realm: &RealmModel, client: Option<&ClientModel>, entity: &V, now: i64| {
            base(realm, client, entity, now).min(cap)
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::USER_SESSION_REMEMBER_ME_NOTE;
    use uuid::Uuid;

    fn realm() -> RealmModel {
        let mut realm = RealmModel::new("r1", "acme");
        realm.sso_session_idle_timeout = 600;
        realm.sso_session_max_lifespan = 3_600;
        realm
    }

    fn user_session(started: i64, refreshed: i64) -> UserSessionEntity {
        let mut entity = UserSessionEntity::new("s1", "r1", "u1");
        entity.started = started;
        entity.last_session_refresh = refreshed;
        entity
    }

    #[test]
    fn test_user_session_lifespan_counts_from_start() {
        let entity = user_session(1_000, 1_000);

        assert_eq!(
            user_session_lifespan(&realm(), None, &entity, 1_600),
            EntryTtl::Millis(3_000_000)
        );
        assert_eq!(user_session_lifespan(&realm(), None, &entity, 4_600), EntryTtl::Expired);
    }

    #[test]
    fn test_user_session_idle_includes_window() {
        let entity = user_session(1_000, 1_000);

        assert_eq!(
            user_session_max_idle(&realm(), None, &entity, 1_600),
            EntryTtl::Millis(120_000)
        );
        assert_eq!(user_session_max_idle(&realm(), None, &entity, 1_720), EntryTtl::Expired);
    }

    #[test]
    fn test_huge_realm_timeouts_do_not_overflow() {
        let mut realm = realm();
        realm.sso_session_max_lifespan = i64::MAX;
        realm.sso_session_idle_timeout = i64::MAX;
        let entity = user_session(1_000, 1_000);

        assert_eq!(
            user_session_lifespan(&realm, None, &entity, 1_600),
            EntryTtl::Millis(u64::MAX)
        );
        assert_eq!(
            user_session_max_idle(&realm, None, &entity, 1_600),
            EntryTtl::Millis(u64::MAX)
        );
    }

    #[test]
    fn test_remember_me_uses_longer_values() {
        let mut realm = realm();
        realm.sso_session_max_lifespan_remember_me = 7_200;
        let mut entity = user_session(0, 0);
        entity.remember_me = true;

        assert_eq!(
            user_session_lifespan(&realm, None, &entity, 0),
            EntryTtl::Millis(7_200_000)
        );
    }

    #[test]
    fn test_offline_lifespan_immortal_unless_enabled() {
        let mut realm = realm();
        let entity = user_session(0, 0);
        assert_eq!(offline_session_lifespan(&realm, None, &entity, 10), EntryTtl::Immortal);

        realm.offline_session_max_lifespan_enabled = true;
        realm.offline_session_max_lifespan = 100;
        assert_eq!(
            offline_session_lifespan(&realm, None, &entity, 10),
            EntryTtl::Millis(90_000)
        );
    }

    #[test]
    fn test_client_override_shortens_client_session() {
        let realm = realm();
        let mut client = ClientModel::new("c1", "portal", "r1");
        client.client_session_idle_timeout = Some(60);
        let mut entity = AuthenticatedClientSessionEntity::new(Uuid::new_v4(), "r1", "c1", "s1");
        entity.timestamp = 1_000;

        assert_eq!(
            client_session_max_idle(&realm, Some(&client), &entity, 1_000),
            EntryTtl::Millis(180_000)
        );
        assert_eq!(
            client_session_max_idle(&realm, None, &entity, 1_000),
            EntryTtl::Millis(720_000)
        );
    }

    #[test]
    fn test_client_session_follows_user_session_start() {
        let realm = realm();
        let mut entity = AuthenticatedClientSessionEntity::new(Uuid::new_v4(), "r1", "c1", "s1");
        entity.timestamp = 3_000;
        entity.notes.insert(
            crate::models::USER_SESSION_STARTED_AT_NOTE.into(),
            "0".into(),
        );
        entity
            .notes
            .insert(USER_SESSION_REMEMBER_ME_NOTE.into(), "false".into());

        assert_eq!(
            client_session_lifespan(&realm, None, &entity, 3_000),
            EntryTtl::Millis(600_000)
        );
    }

    #[test]
    fn test_auth_session_lifespan() {
        let realm = realm();
        let root = RootAuthenticationSessionEntity::new("root", "r1", 100);

        assert_eq!(
            auth_session_lifespan(&realm, None, &root, 100),
            EntryTtl::Millis(1_800_000)
        );
        assert_eq!(auth_session_lifespan(&realm, None, &root, 1_900), EntryTtl::Expired);
    }

    #[test]
    fn test_lifespan_override_caps_immortal_offline_sessions() {
        let base: SessionFunction<UserSessionEntity> = Arc::new(offline_session_lifespan);
        let capped = with_lifespan_override(base.clone(), Some(3_600));
        let entity = user_session(0, 0);

        assert_eq!(base(&realm(), None, &entity, 0), EntryTtl::Immortal);
        assert_eq!(capped(&realm(), None, &entity, 0), EntryTtl::Millis(3_600_000));
        assert!(Arc::ptr_eq(&with_lifespan_override(base.clone(), None), &base));
    }
}
