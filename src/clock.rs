//! Clock Module
//!
//! Time source shared by stores, transactions and timeout functions.
//! Session timestamps are Unix seconds, store bookkeeping is Unix milliseconds.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

/// Source of the current time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current Unix time in milliseconds.
    fn now_millis(&self) -> u64;

    /// Current Unix time in seconds.
    fn now_secs(&self) -> i64 {
        (self.now_millis() / 1000) as i64
    }
}

// == System Clock ==
/// Wall clock backed by chrono.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }
}

// == Manual Clock ==
/// Clock that only moves when told to. Used to drive expiration in tests.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    /// Creates a clock frozen at the given Unix time in seconds.
    pub fn at_secs(secs: i64) -> Self {
        Self {
            millis: AtomicU64::new((secs.max(0) as u64) * 1000),
        }
    }

    /// Moves the clock forward.
    pub fn advance_secs(&self, secs: u64) {
        self.millis.fetch_add(secs * 1000, Ordering::SeqCst);
    }

    pub fn advance_millis(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}
