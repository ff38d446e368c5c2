//! Entity Store Module
//!
//! One in-process cache region (user sessions, client sessions, ...).
//! Combines HashMap storage with LRU tracking, lifespan/idle expiration and
//! version-checked replace. All operations take `&self`; the region guards its
//! own state so concurrent request threads need no external locking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::cache::{CacheKey, CacheStats, Expiration, LruTracker, SessionEntityWrapper, StoredEntry};
use crate::clock::Clock;

#[derive(Debug)]
struct RegionState<K, V> {
    entries: HashMap<K, StoredEntry<V>>,
    lru: LruTracker<K>,
    stats: CacheStats,
    /// Last version handed out; versions are unique per region
    last_version: u64,
}

// == Entity Store ==
/// Concurrent cache region keyed by `K` holding versioned `V` entities.
#[derive(Debug)]
pub struct EntityStore<K, V> {
    name: String,
    state: Mutex<RegionState<K, V>>,
    /// 0 = unbounded
    max_entries: usize,
    clock: Arc<dyn Clock>,
    stopped: AtomicBool,
}

impl<K: CacheKey, V: Clone> EntityStore<K, V> {
    // == Constructor ==
    /// Creates an empty region.
    ///
    /// # Arguments
    /// * `name` - Region name used in logs
    /// * `max_entries` - Bound on live entries, 0 for unbounded
    /// * `clock` - Time source for expiration
    pub fn new(name: impl Into<String>, max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(RegionState {
                entries: HashMap::new(),
                lru: LruTracker::new(),
                stats: CacheStats::new(),
                last_version: 0,
            }),
            max_entries,
            clock,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // == Get ==
    /// Returns the live entry, counting a hit and restarting its idle window.
    ///
    /// Expired entries are removed and counted as misses.
    pub fn get(&self, key: &K) -> Option<SessionEntityWrapper<V>> {
        let now = self.clock.now_millis();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        match state.entries.get_mut(key) {
            None => {
                state.stats.record_miss();
                return None;
            }
            Some(entry) if entry.is_expired(now) => {}
            Some(entry) => {
                entry.touch(now);
                let value = entry.value.clone();
                state.stats.record_hit();
                state.lru.touch(key);
                return Some(value);
            }
        }

        Self::drop_entry(state, key);
        state.stats.record_expirations(1);
        state.stats.record_miss();
        None
    }

    /// Returns the live entry without touching statistics or access order.
    pub fn peek(&self, key: &K) -> Option<SessionEntityWrapper<V>> {
        let now = self.clock.now_millis();
        let state = self.state.lock();
        state
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.peek(key).is_some()
    }

    // == Put ==
    /// Stores a value unconditionally.
    ///
    /// Returns the stored wrapper carrying its new version, or None when the
    /// expiration says the entry is already dead (any previous value is dropped).
    pub fn put(
        &self,
        key: K,
        value: SessionEntityWrapper<V>,
        expiration: Expiration,
    ) -> Option<SessionEntityWrapper<V>> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();

        if expiration.is_expired() {
            trace!(region = %self.name, key = %key, "put skipped, entry already expired");
            Self::drop_entry(&mut state, &key);
            return None;
        }

        Some(self.insert_locked(&mut state, key, value, expiration, now))
    }

    // == Put If Absent ==
    /// Stores the value only if no live entry exists.
    ///
    /// Returns the existing wrapper when one was found, None otherwise.
    pub fn put_if_absent(
        &self,
        key: K,
        value: SessionEntityWrapper<V>,
        expiration: Expiration,
    ) -> Option<SessionEntityWrapper<V>> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();

        if let Some(existing) = state.entries.get(&key) {
            if !existing.is_expired(now) {
                return Some(existing.value.clone());
            }
            Self::drop_entry(&mut state, &key);
            state.stats.record_expirations(1);
        }

        if expiration.is_expired() {
            trace!(region = %self.name, key = %key, "putIfAbsent skipped, entry already expired");
            return None;
        }

        self.insert_locked(&mut state, key, value, expiration, now);
        None
    }

    // == Replace ==
    /// Compare-and-swap: replaces the entry only if its current version equals
    /// the version of `expected`.
    ///
    /// An expired `expiration` turns a successful swap into a removal.
    pub fn replace(
        &self,
        key: &K,
        expected: &SessionEntityWrapper<V>,
        value: SessionEntityWrapper<V>,
        expiration: Expiration,
    ) -> bool {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();

        let current_version = match state.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => entry.value.version(),
            _ => return false,
        };

        if current_version != expected.version() {
            trace!(
                region = %self.name,
                key = %key,
                expected = expected.version(),
                current = current_version,
                "replace rejected, stale version"
            );
            return false;
        }

        if expiration.is_expired() {
            Self::drop_entry(&mut state, key);
            return true;
        }

        self.insert_locked(&mut state, key.clone(), value, expiration, now);
        true
    }

    // == Remove ==
    pub fn remove(&self, key: &K) -> Option<SessionEntityWrapper<V>> {
        let mut state = self.state.lock();
        Self::drop_entry(&mut state, key)
    }

    /// Removes every entry matching the predicate and returns what was removed.
    pub fn remove_where<F>(&self, predicate: F) -> Vec<(K, SessionEntityWrapper<V>)>
    where
        F: Fn(&K, &V) -> bool,
    {
        let mut state = self.state.lock();
        let keys: Vec<K> = state
            .entries
            .iter()
            .filter(|(key, entry)| predicate(key, entry.value.entity()))
            .map(|(key, _)| key.clone())
            .collect();

        keys.into_iter()
            .filter_map(|key| Self::drop_entry(&mut state, &key).map(|value| (key, value)))
            .collect()
    }

    /// Snapshot of the live entities matching the predicate.
    pub fn values_where<F>(&self, predicate: F) -> Vec<SessionEntityWrapper<V>>
    where
        F: Fn(&V) -> bool,
    {
        let now = self.clock.now_millis();
        let state = self.state.lock();
        state
            .entries
            .values()
            .filter(|entry| !entry.is_expired(now) && predicate(entry.value.entity()))
            .map(|entry| entry.value.clone())
            .collect()
    }

    /// Keys of the live entries matching the predicate.
    pub fn keys_where<F>(&self, predicate: F) -> Vec<K>
    where
        F: Fn(&K, &V) -> bool,
    {
        let now = self.clock.now_millis();
        let state = self.state.lock();
        state
            .entries
            .iter()
            .filter(|(key, entry)| !entry.is_expired(now) && predicate(key, entry.value.entity()))
            .map(|(key, _)| key.clone())
            .collect()
    }

    // == Cleanup Expired ==
    /// Removes all expired entries and returns how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        let expired: Vec<K> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            Self::drop_entry(&mut state, key);
        }
        state.stats.record_expirations(expired.len());
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.set_total_entries(state.entries.len());
        stats
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.lru.clear();
    }

    /// Marks the region as shutting down; remote listeners stop applying events.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    fn insert_locked(
        &self,
        state: &mut RegionState<K, V>,
        key: K,
        mut value: SessionEntityWrapper<V>,
        expiration: Expiration,
        now: u64,
    ) -> SessionEntityWrapper<V> {
        let is_overwrite = state.entries.contains_key(&key);
        if !is_overwrite && self.max_entries > 0 && state.entries.len() >= self.max_entries {
            if let Some(evicted) = state.lru.evict_oldest() {
                trace!(region = %self.name, key = %evicted, "evicting least recently used entry");
                state.entries.remove(&evicted);
                state.stats.record_eviction();
            }
        }

        state.last_version += 1;
        value.set_version(state.last_version);

        state.lru.touch(&key);
        state
            .entries
            .insert(key, StoredEntry::new(value.clone(), expiration, now));
        value
    }

    fn drop_entry(state: &mut RegionState<K, V>, key: &K) -> Option<SessionEntityWrapper<V>> {
        let removed = state.entries.remove(key)?;
        state.lru.remove(key);
        Some(removed.value)
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EntryTtl;
    use crate::clock::ManualClock;

    fn store(max_entries: usize) -> (EntityStore<String, String>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_secs(10_000));
        (EntityStore::new("sessions", max_entries, clock.clone()), clock)
    }

    fn wrap(value: &str) -> SessionEntityWrapper<String> {
        SessionEntityWrapper::new(value.to_string())
    }

    #[test]
    fn test_put_assigns_increasing_versions() {
        let (store, _) = store(0);

        let first = store.put("a".into(), wrap("v1"), Expiration::immortal()).unwrap();
        let second = store.put("a".into(), wrap("v2"), Expiration::immortal()).unwrap();

        assert!(second.version() > first.version());
        assert_eq!(store.get(&"a".to_string()).unwrap().entity(), "v2");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_nonexistent_counts_miss() {
        let (store, _) = store(0);

        assert!(store.get(&"missing".to_string()).is_none());
        assert_eq!(store.stats().misses, 1);
    }

    #[test]
    fn test_put_expired_is_not_written() {
        let (store, _) = store(0);
        store.put("a".into(), wrap("old"), Expiration::immortal());

        let stored = store.put(
            "a".into(),
            wrap("dead"),
            Expiration::new(EntryTtl::Expired, EntryTtl::Immortal),
        );

        assert!(stored.is_none());
        assert!(!store.contains_key(&"a".to_string()));
    }

    #[test]
    fn test_put_if_absent_returns_existing() {
        let (store, _) = store(0);
        store.put("a".into(), wrap("first"), Expiration::immortal());

        let existing = store.put_if_absent("a".into(), wrap("second"), Expiration::immortal());

        assert_eq!(existing.unwrap().entity(), "first");
        assert_eq!(store.peek(&"a".to_string()).unwrap().entity(), "first");
    }

    #[test]
    fn test_replace_requires_current_version() {
        let (store, _) = store(0);
        let stored = store.put("a".into(), wrap("v1"), Expiration::immortal()).unwrap();

        assert!(store.replace(&"a".to_string(), &stored, wrap("v2"), Expiration::immortal()));
        // The wrapper read before the first replace is now stale
        assert!(!store.replace(&"a".to_string(), &stored, wrap("v3"), Expiration::immortal()));
        assert_eq!(store.peek(&"a".to_string()).unwrap().entity(), "v2");
    }

    #[test]
    fn test_concurrent_replace_from_same_version_has_one_winner() {
        let (store, _) = store(0);
        let base = store.put("a".into(), wrap("base"), Expiration::immortal()).unwrap();
        let barrier = std::sync::Barrier::new(2);

        let wins: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = ["left", "right"]
                .into_iter()
                .map(|value| {
                    let (store, base, barrier) = (&store, &base, &barrier);
                    scope.spawn(move || {
                        barrier.wait();
                        store.replace(&"a".to_string(), base, wrap(value), Expiration::immortal())
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .filter(|won| *won)
                .count()
        });

        assert_eq!(wins, 1);
        let stored = store.peek(&"a".to_string()).unwrap();
        assert!(stored.version() > base.version());
        assert_ne!(stored.entity(), "base");
    }

    #[test]
    fn test_replace_missing_key_fails() {
        let (store, _) = store(0);
        assert!(!store.replace(&"a".to_string(), &wrap("x"), wrap("y"), Expiration::immortal()));
    }

    #[test]
    fn test_lifespan_expiration_on_get() {
        let (store, clock) = store(0);
        store.put(
            "a".into(),
            wrap("v"),
            Expiration::new(EntryTtl::Millis(1_000), EntryTtl::Immortal),
        );

        assert!(store.get(&"a".to_string()).is_some());
        clock.advance_millis(1_000);

        assert!(store.get(&"a".to_string()).is_none());
        let stats = store.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.total_entries, 0);
    }

    #[test]
    fn test_idle_expiration_extended_by_reads() {
        let (store, clock) = store(0);
        store.put(
            "a".into(),
            wrap("v"),
            Expiration::new(EntryTtl::Immortal, EntryTtl::Millis(500)),
        );

        clock.advance_millis(400);
        assert!(store.get(&"a".to_string()).is_some());
        clock.advance_millis(400);
        assert!(store.get(&"a".to_string()).is_some());
        clock.advance_millis(500);
        assert!(store.get(&"a".to_string()).is_none());
    }

    #[test]
    fn test_lru_eviction_when_bounded() {
        let (store, _) = store(2);
        store.put("a".into(), wrap("1"), Expiration::immortal());
        store.put("b".into(), wrap("2"), Expiration::immortal());
        store.get(&"a".to_string());
        store.put("c".into(), wrap("3"), Expiration::immortal());

        assert_eq!(store.len(), 2);
        assert!(store.contains_key(&"a".to_string()));
        assert!(!store.contains_key(&"b".to_string()));
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn test_remove_where_and_values_where() {
        let (store, _) = store(0);
        store.put("r1-a".into(), wrap("realm-1"), Expiration::immortal());
        store.put("r1-b".into(), wrap("realm-1"), Expiration::immortal());
        store.put("r2-a".into(), wrap("realm-2"), Expiration::immortal());

        assert_eq!(store.values_where(|v| v == "realm-1").len(), 2);

        let removed = store.remove_where(|_, v| v == "realm-1");
        assert_eq!(removed.len(), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_cleanup_expired() {
        let (store, clock) = store(0);
        store.put(
            "short".into(),
            wrap("v"),
            Expiration::new(EntryTtl::Millis(1_000), EntryTtl::Immortal),
        );
        store.put(
            "long".into(),
            wrap("v"),
            Expiration::new(EntryTtl::Millis(60_000), EntryTtl::Immortal),
        );

        clock.advance_secs(2);

        assert_eq!(store.cleanup_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.contains_key(&"long".to_string()));
    }

    #[test]
    fn test_stop_flag() {
        let (store, _) = store(0);
        assert!(store.is_running());
        store.stop();
        assert!(!store.is_running());
    }
}
