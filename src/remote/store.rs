//! Remote store
//!
//! The cross-site store sessions are mirrored to. Values are opaque encoded
//! entities tagged with a version that the remote store bumps on every write;
//! subscribers receive a notification per change.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::cache::{Expiration, SessionEntityWrapper, StoredEntry};
use crate::clock::Clock;
use crate::error::RemoteStoreError;

/// Encoded value together with its remote version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub value: Bytes,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteEventKind {
    Created,
    Modified,
    Removed,
}

/// Change notification pushed by a remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCacheEvent {
    pub kind: RemoteEventKind,
    pub key: String,
    /// Version written by the change, 0 for removals
    pub version: u64,
    /// Set when the remote store re-applied the command after a topology change
    pub command_retried: bool,
}

// == Remote Store Trait ==
/// Client view of a remote store. Every call may fail transiently.
pub trait RemoteStore: Send + Sync {
    fn name(&self) -> &str;

    fn get_with_version(&self, key: &str) -> Result<Option<VersionedValue>, RemoteStoreError>;

    /// Unconditional write; returns the new version.
    fn put(&self, key: &str, value: Bytes, expiration: Expiration) -> Result<u64, RemoteStoreError>;

    /// Writes only if absent; returns the existing value otherwise.
    fn put_if_absent(
        &self,
        key: &str,
        value: Bytes,
        expiration: Expiration,
    ) -> Result<Option<VersionedValue>, RemoteStoreError>;

    /// Writes only if the current version equals `version`.
    fn replace_with_version(
        &self,
        key: &str,
        value: Bytes,
        version: u64,
        expiration: Expiration,
    ) -> Result<bool, RemoteStoreError>;

    fn remove(&self, key: &str) -> Result<bool, RemoteStoreError>;

    /// Registers a new notification subscriber.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<RemoteCacheEvent>;
}

#[derive(Debug, Default)]
struct RemoteState {
    entries: HashMap<String, StoredEntry<Bytes>>,
    last_version: u64,
}

// == In-Memory Remote Store ==
/// Remote store kept in process, shared by the nodes of every site in tests
/// and in the demo node.
#[derive(Debug)]
pub struct InMemoryRemoteStore {
    name: String,
    state: Mutex<RemoteState>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<RemoteCacheEvent>>>,
    pending_failures: AtomicU32,
    clock: Arc<dyn Clock>,
}

impl InMemoryRemoteStore {
    pub fn new(name: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(RemoteState::default()),
            subscribers: Mutex::new(Vec::new()),
            pending_failures: AtomicU32::new(0),
            clock,
        }
    }

    /// Makes the next `count` calls fail with `RemoteStoreError::Unavailable`.
    pub fn inject_failures(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.state
            .lock()
            .entries
            .values()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), RemoteStoreError> {
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        match injected {
            Ok(_) => Err(RemoteStoreError::Unavailable(self.name.clone())),
            Err(_) => Ok(()),
        }
    }

    fn publish(&self, kind: RemoteEventKind, key: &str, version: u64) {
        let event = RemoteCacheEvent {
            kind,
            key: key.to_string(),
            version,
            command_retried: false,
        };
        // Dropped receivers are pruned on the way
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn live<'a>(state: &'a mut RemoteState, key: &str, now: u64) -> Option<&'a StoredEntry<Bytes>> {
        if state.entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            state.entries.remove(key);
        }
        state.entries.get(key)
    }

    fn write(
        state: &mut RemoteState,
        key: &str,
        value: Bytes,
        expiration: Expiration,
        now: u64,
    ) -> u64 {
        state.last_version += 1;
        let mut wrapper = SessionEntityWrapper::new(value);
        wrapper.set_version(state.last_version);
        state
            .entries
            .insert(key.to_string(), StoredEntry::new(wrapper, expiration, now));
        state.last_version
    }
}

impl RemoteStore for InMemoryRemoteStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_with_version(&self, key: &str) -> Result<Option<VersionedValue>, RemoteStoreError> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        Ok(Self::live(&mut state, key, now).map(|entry| VersionedValue {
            value: entry.value.entity().clone(),
            version: entry.value.version(),
        }))
    }

    fn put(
        &self,
        key: &str,
        value: Bytes,
        expiration: Expiration,
    ) -> Result<u64, RemoteStoreError> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let (kind, version) = {
            let mut state = self.state.lock();
            let existed = Self::live(&mut state, key, now).is_some();
            if expiration.is_expired() {
                state.entries.remove(key);
                return Ok(0);
            }
            let version = Self::write(&mut state, key, value, expiration, now);
            let kind = if existed { RemoteEventKind::Modified } else { RemoteEventKind::Created };
            (kind, version)
        };
        trace!(store = %self.name, key, version, "remote put");
        self.publish(kind, key, version);
        Ok(version)
    }

    fn put_if_absent(
        &self,
        key: &str,
        value: Bytes,
        expiration: Expiration,
    ) -> Result<Option<VersionedValue>, RemoteStoreError> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let version = {
            let mut state = self.state.lock();
            if let Some(existing) = Self::live(&mut state, key, now) {
                return Ok(Some(VersionedValue {
                    value: existing.value.entity().clone(),
                    version: existing.value.version(),
                }));
            }
            if expiration.is_expired() {
                return Ok(None);
            }
            Self::write(&mut state, key, value, expiration, now)
        };
        trace!(store = %self.name, key, version, "remote putIfAbsent");
        self.publish(RemoteEventKind::Created, key, version);
        Ok(None)
    }

    fn replace_with_version(
        &self,
        key: &str,
        value: Bytes,
        version: u64,
        expiration: Expiration,
    ) -> Result<bool, RemoteStoreError> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let outcome = {
            let mut state = self.state.lock();
            match Self::live(&mut state, key, now) {
                Some(current) if current.value.version() == version => {}
                _ => return Ok(false),
            }
            if expiration.is_expired() {
                state.entries.remove(key);
                None
            } else {
                Some(Self::write(&mut state, key, value, expiration, now))
            }
        };
        match outcome {
            Some(new_version) => self.publish(RemoteEventKind::Modified, key, new_version),
            None => self.publish(RemoteEventKind::Removed, key, 0),
        }
        Ok(true)
    }

    fn remove(&self, key: &str) -> Result<bool, RemoteStoreError> {
        self.check_available()?;
        let removed = self.state.lock().entries.remove(key).is_some();
        if removed {
            self.publish(RemoteEventKind::Removed, key, 0);
        }
        Ok(removed)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<RemoteCacheEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }
}
