//! Background Tasks Module
//!
//! Tasks that run next to the blocking cache API on the tokio runtime.
//!
//! # Tasks
//! - Expiration cleanup: purges expired sessions at configured intervals
//! - Remote listener: applies remote store notifications to local regions

mod cleanup;
mod remote_listener;

pub use cleanup::spawn_cleanup_task;
pub use remote_listener::{spawn_remote_listener, spawn_remote_listeners};
