//! Session changes
//!
//! Change tasks, the per-request changelog transaction that applies them, and
//! the expiration functions used when committing.

mod task;
pub mod timeouts;
mod transaction;

pub use task::{run_all, CacheOperation, CrossDcMessageStatus, SessionUpdateTask, UpdateFn};
pub use transaction::{ChangelogTransaction, TransactionState};
