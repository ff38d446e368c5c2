//! Cache Entry Module
//!
//! Expiration policy values and the stored form of a region entry.

use crate::cache::SessionEntityWrapper;

// == Entry TTL ==
/// Remaining time an entry may live, as computed by a timeout function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryTtl {
    /// No limit
    Immortal,
    /// Remaining milliseconds
    Millis(u64),
    /// The entry is already past its deadline and must not be stored
    Expired,
}

impl EntryTtl {
    /// Converts a remaining duration in seconds; zero or negative means expired.
    pub fn from_remaining_secs(remaining: i64) -> Self {
        if remaining <= 0 {
            EntryTtl::Expired
        } else {
            EntryTtl::Millis((remaining as u64).saturating_mul(1000))
        }
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, EntryTtl::Expired)
    }

    /// Milliseconds for a bounded TTL, None otherwise.
    pub fn as_millis(&self) -> Option<u64> {
        match self {
            EntryTtl::Millis(ms) => Some(*ms),
            _ => None,
        }
    }

    /// The stricter of two TTLs.
    pub fn min(self, other: EntryTtl) -> EntryTtl {
        match (self, other) {
            (EntryTtl::Expired, _) | (_, EntryTtl::Expired) => EntryTtl::Expired,
            (EntryTtl::Immortal, ttl) | (ttl, EntryTtl::Immortal) => ttl,
            (EntryTtl::Millis(a), EntryTtl::Millis(b)) => EntryTtl::Millis(a.min(b)),
        }
    }
}

// == Expiration ==
/// Lifespan and max-idle pair applied to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiration {
    pub lifespan: EntryTtl,
    pub max_idle: EntryTtl,
}

impl Expiration {
    pub fn new(lifespan: EntryTtl, max_idle: EntryTtl) -> Self {
        Self { lifespan, max_idle }
    }

    /// Expiration for entries that never expire.
    pub fn immortal() -> Self {
        Self::new(EntryTtl::Immortal, EntryTtl::Immortal)
    }

    /// True if either bound says the entry is already expired.
    pub fn is_expired(&self) -> bool {
        self.lifespan.is_expired() || self.max_idle.is_expired()
    }
}

// == Stored Entry ==
/// Represents a single region entry with its expiration bookkeeping.
#[derive(Debug, Clone)]
pub struct StoredEntry<V> {
    /// The stored wrapper
    pub value: SessionEntityWrapper<V>,
    /// Write timestamp (Unix milliseconds)
    pub created_at: u64,
    /// Absolute lifespan deadline (Unix milliseconds), None = no lifespan
    pub expires_at: Option<u64>,
    /// Idle window in milliseconds, None = no idle limit
    pub max_idle_ms: Option<u64>,
    /// Last read or write (Unix milliseconds)
    pub last_access: u64,
}

impl<V> StoredEntry<V> {
    // == Constructor ==
    /// Creates a stored entry written at `now`.
    pub fn new(value: SessionEntityWrapper<V>, expiration: Expiration, now: u64) -> Self {
        Self {
            value,
            created_at: now,
            expires_at: expiration.lifespan.as_millis().map(|ms| now.saturating_add(ms)),
            max_idle_ms: expiration.max_idle.as_millis(),
            last_access: now,
        }
    }

    // == Is Expired ==
    /// An entry is expired once `now` reaches either deadline.
    pub fn is_expired(&self, now: u64) -> bool {
        let lifespan_passed = self.expires_at.is_some_and(|deadline| now >= deadline);
        let idle_passed = self
            .max_idle_ms
            .is_some_and(|idle| now >= self.last_access.saturating_add(idle));
        lifespan_passed || idle_passed
    }

    /// Records an access, restarting the idle window.
    pub fn touch(&mut self, now: u64) {
        self.last_access = now;
    }

    // == Time To Live ==
    /// Remaining milliseconds until the nearest deadline, None if immortal.
    pub fn ttl_remaining_ms(&self, now: u64) -> Option<u64> {
        let lifespan = self.expires_at.map(|deadline| deadline.saturating_sub(now));
        let idle = self
            .max_idle_ms
            .map(|idle| self.last_access.saturating_add(idle).saturating_sub(now));
        match (lifespan, idle) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}
