//! Configuration Module
//!
//! Handles loading node and session cache settings from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;

use crate::remote::{ListenerSettings, RetryPolicy};

/// Default bound on tabs per root authentication session.
pub const DEFAULT_AUTH_SESSIONS_LIMIT: usize = 300;

/// Node configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Cluster node name; generated when unset
    pub node_name: Option<String>,
    /// Datacenter of this node; unset for single-site deployments
    pub site_name: Option<String>,
    /// Maximum tabs per root authentication session
    pub auth_sessions_limit: usize,
    /// Mirror session regions to the remote store
    pub remote_store_enabled: bool,
    /// Bound on online user sessions in memory, 0 for unbounded
    pub session_cache_max_entries: usize,
    /// Bound on offline user sessions in memory, 0 for unbounded
    pub offline_session_cache_max_entries: usize,
    /// Cap in seconds on how long offline sessions stay in memory
    pub offline_session_cache_entry_lifespan_override: Option<i64>,
    /// Background cleanup task interval in seconds
    pub cleanup_interval: u64,
    /// Attempts per remote store call before giving up
    pub remote_retry_attempts: u32,
    /// Base backoff in milliseconds between remote store attempts
    pub remote_retry_base_ms: u64,
    /// Bound on compare-and-swap attempts per key
    pub replace_retries: u32,
    /// First backoff in milliseconds when a remote event overtakes its write
    pub premature_event_backoff_ms: u64,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `NODE_NAME` - Cluster node name (default: generated `node_<n>`)
    /// - `SITE_NAME` - Datacenter name (default: none)
    /// - `AUTH_SESSIONS_LIMIT` - Tabs per root authentication session (default: 300)
    /// - `REMOTE_STORE_ENABLED` - Mirror sessions to the remote store (default: false)
    /// - `SESSION_CACHE_MAX_ENTRIES` - Online session bound (default: 0, unbounded)
    /// - `OFFLINE_SESSION_CACHE_MAX_ENTRIES` - Offline session bound (default: 0)
    /// - `OFFLINE_SESSION_LIFESPAN_OVERRIDE` - Offline in-memory lifespan cap in seconds
    /// - `CLEANUP_INTERVAL` - Cleanup frequency in seconds (default: 60)
    /// - `REMOTE_RETRY_ATTEMPTS` - Remote store attempts (default: 10)
    /// - `REMOTE_RETRY_BASE_MS` - Remote store base backoff (default: 10)
    /// - `REPLACE_RETRIES` - Compare-and-swap attempts (default: 10)
    /// - `PREMATURE_EVENT_BACKOFF_MS` - Remote event backoff (default: 25)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let auth_sessions_limit: i64 = env_or(
            "AUTH_SESSIONS_LIMIT",
            DEFAULT_AUTH_SESSIONS_LIMIT as i64,
        );

        Self {
            node_name: env_opt("NODE_NAME"),
            site_name: env_opt("SITE_NAME"),
            auth_sessions_limit: if auth_sessions_limit > 0 {
                auth_sessions_limit as usize
            } else {
                DEFAULT_AUTH_SESSIONS_LIMIT
            },
            remote_store_enabled: env_or("REMOTE_STORE_ENABLED", defaults.remote_store_enabled),
            session_cache_max_entries: env_or(
                "SESSION_CACHE_MAX_ENTRIES",
                defaults.session_cache_max_entries,
            ),
            offline_session_cache_max_entries: env_or(
                "OFFLINE_SESSION_CACHE_MAX_ENTRIES",
                defaults.offline_session_cache_max_entries,
            ),
            offline_session_cache_entry_lifespan_override: env_opt(
                "OFFLINE_SESSION_LIFESPAN_OVERRIDE",
            )
            .and_then(|v| v.parse().ok()),
            cleanup_interval: env_or("CLEANUP_INTERVAL", defaults.cleanup_interval),
            remote_retry_attempts: env_or("REMOTE_RETRY_ATTEMPTS", defaults.remote_retry_attempts),
            remote_retry_base_ms: env_or("REMOTE_RETRY_BASE_MS", defaults.remote_retry_base_ms),
            replace_retries: env_or("REPLACE_RETRIES", defaults.replace_retries),
            premature_event_backoff_ms: env_or(
                "PREMATURE_EVENT_BACKOFF_MS",
                defaults.premature_event_backoff_ms,
            ),
        }
    }

    /// Configured node name, or a generated `node_<n>`.
    pub fn resolve_node_name(&self) -> String {
        self.node_name
            .clone()
            .unwrap_or_else(|| format!("node_{}", rand::thread_rng().gen_range(0..1_000_000)))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.remote_retry_attempts,
            Duration::from_millis(self.remote_retry_base_ms),
        )
    }

    pub fn listener_settings(&self) -> ListenerSettings {
        ListenerSettings {
            replace_retries: self.replace_retries,
            premature_event_backoff: Duration::from_millis(self.premature_event_backoff_ms),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: None,
            site_name: None,
            auth_sessions_limit: DEFAULT_AUTH_SESSIONS_LIMIT,
            remote_store_enabled: false,
            session_cache_max_entries: 0,
            offline_session_cache_max_entries: 0,
            offline_session_cache_entry_lifespan_override: None,
            cleanup_interval: 60,
            remote_retry_attempts: 10,
            remote_retry_base_ms: 10,
            replace_retries: 10,
            premature_event_backoff_ms: 25,
        }
    }
}
