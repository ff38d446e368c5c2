//! Cache Module
//!
//! In-process session regions: versioned entries with lifespan and idle
//! expiration, LRU eviction for bounded regions, and compare-and-swap replace.

mod entry;
mod lru;
mod region;
mod stats;
mod store;
mod wrapper;


use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

// Re-export public types
pub use entry::{EntryTtl, Expiration, StoredEntry};
pub use lru::LruTracker;
pub use region::{SessionFunction, SessionRegion};
pub use stats::CacheStats;
pub use store::EntityStore;
pub use wrapper::SessionEntityWrapper;

// == Cache Key ==
/// Key of a session region.
///
/// Keys travel to the remote store and back as strings, so they must render
/// with `Display` and parse again with `FromStr`.
pub trait CacheKey:
    Clone + Eq + Hash + fmt::Debug + fmt::Display + FromStr + Send + Sync + 'static
{
}

impl<T> CacheKey for T where
    T: Clone + Eq + Hash + fmt::Debug + fmt::Display + FromStr + Send + Sync + 'static
{
}
