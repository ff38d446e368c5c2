//! Changelog transaction
//!
//! Per-request buffer of session changes. Tasks run immediately against a
//! pending copy of the entity so later reads in the same request see them;
//! the store is only written on commit, one merged operation per key.

use std::collections::HashMap;

use tracing::{debug, trace, warn};

use crate::cache::{CacheKey, Expiration, SessionEntityWrapper, SessionRegion};
use crate::changes::{run_all, CacheOperation, CrossDcMessageStatus, SessionUpdateTask};
use crate::error::{CacheError, Result};
use crate::models::{PersistenceState, SessionEntity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committing,
    Closed,
}

/// Pending view and task list of one key.
struct SessionUpdates<V> {
    wrapper: SessionEntityWrapper<V>,
    tasks: Vec<SessionUpdateTask<V>>,
    persistence: PersistenceState,
}

impl<V> SessionUpdates<V> {
    fn new(wrapper: SessionEntityWrapper<V>, persistence: PersistenceState) -> Self {
        Self {
            wrapper,
            tasks: Vec::new(),
            persistence,
        }
    }

    fn is_scheduled_for_remove(&self) -> bool {
        self.tasks
            .iter()
            .any(|task| task.operation() == CacheOperation::Remove)
    }

    /// Merged operation and cross-site status, None if no task was enqueued.
    fn merged(&self) -> Option<(CacheOperation, CrossDcMessageStatus)> {
        let (first, rest) = self.tasks.split_first()?;
        Some(rest.iter().fold(
            (first.operation(), first.cross_dc()),
            |(operation, cross_dc), task| {
                (operation.merge(task.operation()), cross_dc.merge(task.cross_dc()))
            },
        ))
    }
}

// == Changelog Transaction ==
pub struct ChangelogTransaction<K, V> {
    region: SessionRegion<K, V>,
    replace_retries: u32,
    state: TransactionState,
    /// Keys in first-touch order
    order: Vec<K>,
    updates: HashMap<K, SessionUpdates<V>>,
}

impl<K: CacheKey, V: SessionEntity> ChangelogTransaction<K, V> {
    /// # Arguments
    /// * `region` - Region the transaction reads from and commits to
    /// * `replace_retries` - Bound on CAS attempts per key at commit
    pub fn new(region: SessionRegion<K, V>, replace_retries: u32) -> Self {
        Self {
            region,
            replace_retries: replace_retries.max(1),
            state: TransactionState::Open,
            order: Vec::new(),
            updates: HashMap::new(),
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn region(&self) -> &SessionRegion<K, V> {
        &self.region
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == TransactionState::Open {
            Ok(())
        } else {
            Err(CacheError::TransactionClosed)
        }
    }

    fn track(&mut self, key: K, updates: SessionUpdates<V>) {
        if self.updates.insert(key.clone(), updates).is_none() {
            self.order.push(key);
        }
    }

    // == Add Task ==
    /// Enqueues a task on an existing entity and runs it on the pending view.
    ///
    /// A key unknown to both the transaction and the store is ignored.
    pub fn add_task(&mut self, key: K, task: SessionUpdateTask<V>) -> Result<()> {
        self.ensure_open()?;

        if !self.updates.contains_key(&key) {
            let Some(wrapper) = self.region.store().get(&key) else {
                debug!(
                    region = %self.region.name(),
                    key = %key,
                    "Not present cache item, task ignored",
                );
                return Ok(());
            };
            self.track(key.clone(), SessionUpdates::new(wrapper, PersistenceState::Persistent));
        }

        if let Some(updates) = self.updates.get_mut(&key) {
            task.run_update(updates.wrapper.entity_mut());
            updates.tasks.push(task);
        }
        Ok(())
    }

    /// Enqueues a task together with the entity it applies to, typically a
    /// freshly created session. Replaces any pending view of the key, unless
    /// the key is already scheduled for removal.
    pub fn add_task_with_entity(
        &mut self,
        key: K,
        task: SessionUpdateTask<V>,
        mut entity: V,
        persistence: PersistenceState,
    ) -> Result<()> {
        self.ensure_open()?;

        if let Some(existing) = self.updates.get_mut(&key) {
            if existing.is_scheduled_for_remove() {
                debug!(
                    region = %self.region.name(),
                    key = %key,
                    "Key scheduled for removal, entity ignored",
                );
                existing.tasks.push(task);
                return Ok(());
            }
        }

        task.run_update(&mut entity);
        let mut updates = SessionUpdates::new(SessionEntityWrapper::new(entity), persistence);
        updates.tasks.push(task);
        self.track(key, updates);
        Ok(())
    }

    // == Get ==
    /// Pending view of `key`, falling back to the store.
    ///
    /// Returns None for a key with a pending removal.
    pub fn get(&mut self, key: &K) -> Option<SessionEntityWrapper<V>> {
        if let Some(updates) = self.updates.get(key) {
            if updates.is_scheduled_for_remove() {
                return None;
            }
            return Some(updates.wrapper.clone());
        }

        let wrapper = self.region.store().get(key)?;
        if self.state == TransactionState::Open {
            self.track(
                key.clone(),
                SessionUpdates::new(wrapper.clone(), PersistenceState::Persistent),
            );
        }
        Some(wrapper)
    }

    /// Replaces the pending view after the entity was refreshed out of band,
    /// keeping the tasks already enqueued.
    pub fn reload_entity(&mut self, key: K, wrapper: SessionEntityWrapper<V>) {
        let (tasks, persistence) = match self.updates.remove(&key) {
            Some(existing) => (existing.tasks, existing.persistence),
            None => (Vec::new(), PersistenceState::Persistent),
        };
        if !self.order.contains(&key) {
            self.order.push(key.clone());
        }
        self.updates.insert(
            key,
            SessionUpdates {
                wrapper,
                tasks,
                persistence,
            },
        );
    }

    pub fn has_pending_changes(&self) -> bool {
        self.updates.values().any(|updates| !updates.tasks.is_empty())
    }

    // == Rollback ==
    pub fn rollback(&mut self) {
        if self.state == TransactionState::Closed {
            return;
        }
        self.order.clear();
        self.updates.clear();
        self.state = TransactionState::Closed;
    }

    // == Commit ==
    /// Writes every pending change to the store and forwards it to the
    /// remote store according to its cross-site status.
    ///
    /// All keys are processed even if one fails; the first synchronous
    /// forwarding error is returned afterwards.
    pub fn commit(&mut self) -> Result<()> {
        if self.state == TransactionState::Closed {
            return Ok(());
        }
        self.state = TransactionState::Committing;

        let order = std::mem::take(&mut self.order);
        let mut updates = std::mem::take(&mut self.updates);
        let mut first_error = None;

        for key in order {
            let Some(session_updates) = updates.remove(&key) else {
                continue;
            };
            if let Err(e) = self.commit_key(&key, session_updates) {
                warn!(
                    region = %self.region.name(),
                    key = %key,
                    error = %e,
                    "Failed to forward change to remote store",
                );
                first_error.get_or_insert(e);
            }
        }

        self.state = TransactionState::Closed;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn commit_key(&self, key: &K, updates: SessionUpdates<V>) -> Result<()> {
        if updates.persistence == PersistenceState::Transient {
            trace!(region = %self.region.name(), key = %key, "Transient entity, not written");
            return Ok(());
        }
        let Some((operation, cross_dc)) = updates.merged() else {
            return Ok(());
        };

        let expiration = self.region.expiration_for(updates.wrapper.entity());
        let Some((applied, committed)) =
            self.run_operation_locally(key, operation, &updates, expiration)
        else {
            return Ok(());
        };

        self.forward(key, applied, cross_dc, &updates.tasks, committed.entity(), expiration)
    }

    /// Applies the merged operation to the store.
    ///
    /// Returns the operation to forward and the committed wrapper, or None
    /// when nothing was written.
    fn run_operation_locally(
        &self,
        key: &K,
        operation: CacheOperation,
        updates: &SessionUpdates<V>,
        expiration: Expiration,
    ) -> Option<(CacheOperation, SessionEntityWrapper<V>)> {
        let store = self.region.store();

        match operation {
            CacheOperation::Remove => {
                store.remove(key);
                Some((CacheOperation::Remove, updates.wrapper.clone()))
            }
            CacheOperation::AddIfAbsent => {
                if expiration.is_expired() {
                    trace!(
                        region = %self.region.name(),
                        key = %key,
                        "Entity already expired, not added",
                    );
                    return None;
                }
                match store.put_if_absent(key.clone(), updates.wrapper.clone(), expiration) {
                    None => Some((CacheOperation::AddIfAbsent, updates.wrapper.clone())),
                    Some(existing) => {
                        debug!(
                            region = %self.region.name(),
                            key = %key,
                            "Existing entity in cache, will update it",
                        );
                        let mut updated = existing.clone();
                        run_all(&updates.tasks, updated.entity_mut());
                        self.replace(key, existing, updated, &updates.tasks, expiration)
                            .map(|committed| (CacheOperation::AddIfAbsent, committed))
                    }
                }
            }
            CacheOperation::Replace => {
                if expiration.is_expired() {
                    trace!(region = %self.region.name(), key = %key, "Entity expired, dropping it");
                    store.remove(key);
                    return Some((CacheOperation::Remove, updates.wrapper.clone()));
                }
                self.replace(
                    key,
                    updates.wrapper.clone(),
                    updates.wrapper.clone(),
                    &updates.tasks,
                    expiration,
                )
                    .map(|committed| (CacheOperation::Replace, committed))
            }
        }
    }

    // == Replace ==
    /// CAS loop: on conflict reloads the stored entity and re-runs the tasks.
    fn replace(
        &self,
        key: &K,
        mut expected: SessionEntityWrapper<V>,
        mut updated: SessionEntityWrapper<V>,
        tasks: &[SessionUpdateTask<V>],
        expiration: Expiration,
    ) -> Option<SessionEntityWrapper<V>> {
        let store = self.region.store();

        for iteration in 1..=self.replace_retries {
            if store.replace(key, &expected, updated.clone(), expiration) {
                trace!(region = %self.region.name(), key = %key, iteration, "Replace succeeded");
                return Some(updated);
            }
            debug!(
                region = %self.region.name(),
                key = %key,
                version = expected.version(),
                iteration,
                "Replace failed, will try again"
            );

            let Some(current) = store.peek(key) else {
                debug!(
                    region = %self.region.name(),
                    key = %key,
                    "Entity not found, maybe removed in the meantime; replace ignored",
                );
                return None;
            };
            updated = current.clone();
            run_all(tasks, updated.entity_mut());
            expected = current;
        }

        warn!(
            region = %self.region.name(),
            key = %key,
            retries = self.replace_retries,
            "Failed to replace entity"
        );
        None
    }

    // == Remote Forwarding ==
    fn forward(
        &self,
        key: &K,
        operation: CacheOperation,
        cross_dc: CrossDcMessageStatus,
        tasks: &[SessionUpdateTask<V>],
        entity: &V,
        expiration: Expiration,
    ) -> Result<()> {
        let Some(invoker) = self.region.remote() else {
            return Ok(());
        };
        let remote_key = key.to_string();

        match cross_dc {
            CrossDcMessageStatus::NotNeeded => Ok(()),
            CrossDcMessageStatus::Sync => {
                invoker.run_task(&remote_key, operation, tasks, entity, expiration)
            }
            CrossDcMessageStatus::Async => {
                if let Err(e) = invoker.run_task(
                    &remote_key,
                    operation,
                    tasks,
                    entity,
                    expiration,
                ) {
                    warn!(
                        region = %self.region.name(),
                        key = %key,
                        error = %e,
                        "Asynchronous remote update failed",
                    );
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::cache::EntityStore;
    use crate::changes::timeouts;
    use crate::clock::ManualClock;
    use crate::models::{InMemoryDirectory, RealmModel, UserSessionEntity};
    use crate::remote::{InMemoryRemoteStore, RemoteCacheInvoker, RetryPolicy};

    const NOW: i64 = 10_000;

    fn region() -> SessionRegion<String, UserSessionEntity> {
        let clock = Arc::new(ManualClock::at_secs(NOW));
        let directory = Arc::new(InMemoryDirectory::new());
        directory.add_realm(RealmModel::new("r1", "acme"));
        SessionRegion::new(
            Arc::new(EntityStore::new("sessions", 0, clock)),
            Arc::new(timeouts::user_session_lifespan),
            Arc::new(timeouts::user_session_max_idle),
            directory,
        )
    }

    fn session(id: &str) -> UserSessionEntity {
        let mut entity = UserSessionEntity::new(id, "r1", "u1");
        entity.started = NOW;
        entity.last_session_refresh = NOW;
        entity
    }

    fn set_note(value: &'static str) -> SessionUpdateTask<UserSessionEntity> {
        SessionUpdateTask::replace(move |s: &mut UserSessionEntity| {
            s.notes.insert("note".into(), value.into());
        })
    }

    #[test]
    fn test_read_your_writes_before_commit() {
        let region = region();
        let mut tx = ChangelogTransaction::new(region.clone(), 10);

        tx.add_task_with_entity(
            "s1".into(),
            SessionUpdateTask::add_if_absent(),
            session("s1"),
            PersistenceState::Persistent,
        )
        .unwrap();
        tx.add_task("s1".into(), set_note("a")).unwrap();

        assert_eq!(tx.get(&"s1".to_string()).unwrap().entity().notes.get("note").unwrap(), "a");
        assert!(region.store().is_empty());

        tx.commit().unwrap();

        let stored = region.store().peek(&"s1".to_string()).unwrap();
        assert_eq!(stored.entity().notes.get("note").unwrap(), "a");
        assert_eq!(tx.state(), TransactionState::Closed);
    }

    #[test]
    fn test_task_on_unknown_key_is_ignored() {
        let mut tx = ChangelogTransaction::new(region(), 10);

        tx.add_task("missing".into(), set_note("a")).unwrap();

        assert!(!tx.has_pending_changes());
        assert!(tx.get(&"missing".to_string()).is_none());
    }

    #[test]
    fn test_remove_dominates_pending_updates() {
        let region = region();
        region
            .store()
            .put("s1".into(), SessionEntityWrapper::new(session("s1")), Expiration::immortal());
        let mut tx = ChangelogTransaction::new(region.clone(), 10);

        tx.add_task("s1".into(), set_note("a")).unwrap();
        tx.add_task("s1".into(), SessionUpdateTask::remove()).unwrap();
        tx.add_task("s1".into(), set_note("b")).unwrap();

        assert!(tx.get(&"s1".to_string()).is_none());
        tx.commit().unwrap();
        assert!(region.store().is_empty());
    }

    #[test]
    fn test_remove_dominates_later_entity_write() {
        let region = region();
        region
            .store()
            .put("s1".into(), SessionEntityWrapper::new(session("s1")), Expiration::immortal());
        let mut tx = ChangelogTransaction::new(region.clone(), 10);

        tx.add_task("s1".into(), SessionUpdateTask::remove()).unwrap();
        tx.add_task_with_entity(
            "s1".into(),
            SessionUpdateTask::add_if_absent(),
            session("s1"),
            PersistenceState::Persistent,
        )
        .unwrap();

        assert!(tx.get(&"s1".to_string()).is_none());
        tx.commit().unwrap();
        assert!(region.store().is_empty());
    }

    #[test]
    fn test_replace_conflict_reapplies_tasks_on_fresh_entity() {
        let region = region();
        region
            .store()
            .put("s1".into(), SessionEntityWrapper::new(session("s1")), Expiration::immortal());
        let mut tx = ChangelogTransaction::new(region.clone(), 10);
        tx.add_task("s1".into(), set_note("mine")).unwrap();

        // Another request commits in between
        let mut concurrent = session("s1");
        concurrent.ip_address = Some("10.0.0.1".into());
        region
            .store()
            .put("s1".into(), SessionEntityWrapper::new(concurrent), Expiration::immortal());

        tx.commit().unwrap();

        let stored = region.store().peek(&"s1".to_string()).unwrap();
        assert_eq!(stored.entity().notes.get("note").unwrap(), "mine");
        assert_eq!(stored.entity().ip_address.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_add_if_absent_race_falls_back_to_replace() {
        let region = region();
        let mut tx = ChangelogTransaction::new(region.clone(), 10);
        tx.add_task_with_entity(
            "s1".into(),
            SessionUpdateTask::add_if_absent(),
            session("s1"),
            PersistenceState::Persistent,
        )
        .unwrap();
        tx.add_task("s1".into(), set_note("mine")).unwrap();

        let mut winner = session("s1");
        winner.login_username = Some("winner".into());
        region
            .store()
            .put("s1".into(), SessionEntityWrapper::new(winner), Expiration::immortal());

        tx.commit().unwrap();

        let stored = region.store().peek(&"s1".to_string()).unwrap();
        assert_eq!(stored.entity().login_username.as_deref(), Some("winner"));
        assert_eq!(stored.entity().notes.get("note").unwrap(), "mine");
    }

    #[test]
    fn test_expired_entity_is_never_written() {
        let region = region();
        let mut tx = ChangelogTransaction::new(region.clone(), 10);
        let mut stale = session("s1");
        stale.started = NOW - 36_000;

        tx.add_task_with_entity(
            "s1".into(),
            SessionUpdateTask::add_if_absent(),
            stale,
            PersistenceState::Persistent,
        )
        .unwrap();
        tx.commit().unwrap();

        assert!(!region.store().contains_key(&"s1".to_string()));
    }

    #[test]
    fn test_expired_replace_drops_entry() {
        let region = region();
        region
            .store()
            .put("s1".into(), SessionEntityWrapper::new(session("s1")), Expiration::immortal());
        let mut tx = ChangelogTransaction::new(region.clone(), 10);

        tx.add_task(
            "s1".into(),
            SessionUpdateTask::replace(|s: &mut UserSessionEntity| s.last_session_refresh = 0),
        )
        .unwrap();
        tx.commit().unwrap();

        assert!(region.store().is_empty());
    }

    #[test]
    fn test_transient_entity_not_written() {
        let region = region();
        let mut tx = ChangelogTransaction::new(region.clone(), 10);

        tx.add_task_with_entity(
            "s1".into(),
            SessionUpdateTask::add_if_absent(),
            session("s1"),
            PersistenceState::Transient,
        )
        .unwrap();
        assert!(tx.get(&"s1".to_string()).is_some());
        tx.commit().unwrap();

        assert!(region.store().is_empty());
    }

    #[test]
    fn test_closed_transaction_rejects_tasks() {
        let mut tx = ChangelogTransaction::new(region(), 10);
        tx.rollback();

        let err = tx.add_task("s1".into(), set_note("a")).unwrap_err();

        assert!(matches!(err, CacheError::TransactionClosed));
        assert!(tx.commit().is_ok());
    }

    #[test]
    fn test_rollback_discards_changes() {
        let region = region();
        let mut tx = ChangelogTransaction::new(region.clone(), 10);
        tx.add_task_with_entity(
            "s1".into(),
            SessionUpdateTask::add_if_absent(),
            session("s1"),
            PersistenceState::Persistent,
        )
        .unwrap();

        tx.rollback();
        tx.commit().unwrap();

        assert!(region.store().is_empty());
    }

    #[test]
    fn test_reload_entity_keeps_tasks() {
        let region = region();
        region
            .store()
            .put("s1".into(), SessionEntityWrapper::new(session("s1")), Expiration::immortal());
        let mut tx = ChangelogTransaction::new(region.clone(), 10);
        tx.add_task("s1".into(), set_note("a")).unwrap();

        let mut refreshed = session("s1");
        refreshed.broker_session_id = Some("broker".into());
        let stored = region
            .store()
            .put("s1".into(), SessionEntityWrapper::new(refreshed), Expiration::immortal())
            .unwrap();
        tx.reload_entity("s1".into(), stored);

        assert_eq!(
            tx.get(&"s1".to_string()).unwrap().entity().broker_session_id.as_deref(),
            Some("broker")
        );
        assert!(tx.has_pending_changes());
    }

    fn remote_region() -> (SessionRegion<String, UserSessionEntity>, Arc<InMemoryRemoteStore>) {
        let clock = Arc::new(ManualClock::at_secs(NOW));
        let remote = Arc::new(InMemoryRemoteStore::new("sessions", clock));
        let invoker = Arc::new(RemoteCacheInvoker::new(
            remote.clone(),
            RetryPolicy::immediate(2),
            10,
        ));
        (region().with_remote(invoker), remote)
    }

    #[test]
    fn test_sync_forwarding_error_propagates_after_local_commit() {
        let (region, remote) = remote_region();
        let mut tx = ChangelogTransaction::new(region.clone(), 10);
        tx.add_task_with_entity(
            "s1".into(),
            SessionUpdateTask::add_if_absent(),
            session("s1"),
            PersistenceState::Persistent,
        )
        .unwrap();
        remote.inject_failures(2);

        let err = tx.commit().unwrap_err();

        assert!(matches!(err, CacheError::RemoteExhausted { attempts: 2, .. }));
        assert!(region.store().contains_key(&"s1".to_string()));
    }

    #[test]
    fn test_async_forwarding_error_is_only_logged() {
        let (region, remote) = remote_region();
        let mut tx = ChangelogTransaction::new(region.clone(), 10);
        tx.add_task_with_entity(
            "s1".into(),
            SessionUpdateTask::add_if_absent().with_cross_dc(CrossDcMessageStatus::Async),
            session("s1"),
            PersistenceState::Persistent,
        )
        .unwrap();
        remote.inject_failures(2);

        assert!(tx.commit().is_ok());
        assert!(remote.is_empty());
    }

    #[test]
    fn test_sync_commit_mirrors_to_remote() {
        let (region, remote) = remote_region();
        let mut tx = ChangelogTransaction::new(region, 10);
        tx.add_task_with_entity(
            "s1".into(),
            SessionUpdateTask::add_if_absent(),
            session("s1"),
            PersistenceState::Persistent,
        )
        .unwrap();
        tx.commit().unwrap();

        assert_eq!(remote.len(), 1);
    }
}
