//! Error types for the session cache
//!
//! Provides unified error handling using thiserror. Cache misses are not
//! errors: lookups return `Option` and `None` means "not found anywhere".

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the session cache.
#[derive(Error, Debug)]
pub enum CacheError {
    /// A task was enqueued on a transaction that already committed or rolled back
    #[error("Transaction already closed")]
    TransactionClosed,

    /// A remote store operation kept failing until the retry bound was hit
    #[error("Remote store '{store}' failed after {attempts} attempts: {source}")]
    RemoteExhausted {
        store: String,
        attempts: u32,
        #[source]
        source: RemoteStoreError,
    },

    /// Single remote store failure outside of a retry harness
    #[error(transparent)]
    Remote(#[from] RemoteStoreError),

    /// Malformed or unknown cluster payload
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Persistent backing store failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Entity could not be encoded for, or decoded from, the remote store
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unsupported lookup or invalid argument
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

// == Remote Store Error ==
/// Transient client errors raised by a remote store.
///
/// These are always retryable; the retry harness decides when to give up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteStoreError {
    /// The remote store could not be reached
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    /// The request reached the remote store but the exchange failed
    #[error("Remote transport error: {0}")]
    Transport(String),
}

// == Wire Error ==
/// Failures decoding cluster event payloads.
///
/// Unknown tags and versions are hard failures: misreading cluster state is
/// worse than rejecting the message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Unknown event type tag: {0}")]
    UnknownEventType(u8),

    #[error("Unknown version {version} for event '{event}'")]
    UnknownVersion { event: &'static str, version: u8 },

    #[error("Payload truncated while reading {0}")]
    Truncated(&'static str),

    #[error("Invalid UTF-8 in field {0}")]
    InvalidUtf8(&'static str),

    #[error("Missing required field {0}")]
    MissingField(&'static str),
}

// == Result Type Alias ==
/// Convenience Result type for the session cache.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_exhausted_message_names_store_and_attempts() {
        let err = CacheError::RemoteExhausted {
            store: "sessions".to_string(),
            attempts: 10,
            source: RemoteStoreError::Unavailable("connection refused".to_string()),
        };

        let message = err.to_string();
        assert!(message.contains("sessions"));
        assert!(message.contains("10 attempts"));
    }

    #[test]
    fn test_wire_error_converts_into_cache_error() {
        let err: CacheError = WireError::UnknownEventType(42).into();
        assert!(matches!(err, CacheError::Wire(WireError::UnknownEventType(42))));
    }
}
