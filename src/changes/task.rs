//! Change tasks
//!
//! A task is one pending mutation of a session entity: an operation, an
//! optional update closure and the cross-site replication mode. Several tasks
//! on the same key inside one transaction coalesce into a single operation.

use std::fmt;
use std::sync::Arc;

/// Operation a task performs on the cache entry of its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheOperation {
    /// Create the entry unless one already exists
    AddIfAbsent,
    /// Update the existing entry
    Replace,
    /// Delete the entry
    Remove,
}

impl CacheOperation {
    // == Merge ==
    /// Operation resulting from `self` followed by `next` on the same key.
    ///
    /// REMOVE dominates everything. An ADD_IF_ABSENT absorbs later REPLACEs
    /// since the update runs on the pending entity before it is added. A
    /// late ADD_IF_ABSENT on an entry already pending for replace is a no-op.
    pub fn merge(self, next: CacheOperation) -> CacheOperation {
        match (self, next) {
            (CacheOperation::Remove, _) | (_, CacheOperation::Remove) => CacheOperation::Remove,
            (CacheOperation::AddIfAbsent, _) => CacheOperation::AddIfAbsent,
            (CacheOperation::Replace, _) => CacheOperation::Replace,
        }
    }
}

/// Whether and how a committed change is forwarded to the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum CrossDcMessageStatus {
    /// Stays in this site
    NotNeeded,
    /// Forwarded in the background, failures are only logged
    Async,
    /// Forwarded within commit, failures propagate
    #[default]
    Sync,
}

impl CrossDcMessageStatus {
    /// The stricter of two statuses.
    pub fn merge(self, other: CrossDcMessageStatus) -> CrossDcMessageStatus {
        self.max(other)
    }
}

/// Update applied to an entity, re-runnable on a fresher copy after a CAS conflict.
pub type UpdateFn<V> = Arc<dyn Fn(&mut V) + Send + Sync>;

// == Session Update Task ==
pub struct SessionUpdateTask<V> {
    operation: CacheOperation,
    cross_dc: CrossDcMessageStatus,
    update: Option<UpdateFn<V>>,
}

impl<V> Clone for SessionUpdateTask<V> {
    fn clone(&self) -> Self {
        Self {
            operation: self.operation,
            cross_dc: self.cross_dc,
            update: self.update.clone(),
        }
    }
}

impl<V> fmt::Debug for SessionUpdateTask<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionUpdateTask")
            .field("operation", &self.operation)
            .field("cross_dc", &self.cross_dc)
            .field("has_update", &self.update.is_some())
            .finish()
    }
}

impl<V> SessionUpdateTask<V> {
    /// Creates the entity passed along with the task, replicated synchronously.
    pub fn add_if_absent() -> Self {
        Self {
            operation: CacheOperation::AddIfAbsent,
            cross_dc: CrossDcMessageStatus::Sync,
            update: None,
        }
    }

    pub fn remove() -> Self {
        Self {
            operation: CacheOperation::Remove,
            cross_dc: CrossDcMessageStatus::Sync,
            update: None,
        }
    }

    /// Replaces the entity after running `update` on it.
    pub fn replace<F>(update: F) -> Self
    where
        F: Fn(&mut V) + Send + Sync + 'static,
    {
        Self {
            operation: CacheOperation::Replace,
            cross_dc: CrossDcMessageStatus::Sync,
            update: Some(Arc::new(update)),
        }
    }

    pub fn with_cross_dc(mut self, status: CrossDcMessageStatus) -> Self {
        self.cross_dc = status;
        self
    }

    pub fn operation(&self) -> CacheOperation {
        self.operation
    }

    pub fn cross_dc(&self) -> CrossDcMessageStatus {
        self.cross_dc
    }

    /// Runs the update, if any, against `entity`.
    pub fn run_update(&self, entity: &mut V) {
        if let Some(update) = &self.update {
            update(entity);
        }
    }
}

/// Runs every task of a merged update, in enqueue order.
pub fn run_all<V>(tasks: &[SessionUpdateTask<V>], entity: &mut V) {
    for task in tasks {
        task.run_update(entity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_dominates() {
        use CacheOperation::*;
        assert_eq!(AddIfAbsent.merge(Remove), Remove);
        assert_eq!(Remove.merge(Replace), Remove);
        assert_eq!(Replace.merge(Remove), Remove);
    }

    #[test]
    fn test_add_absorbs_replace() {
        use CacheOperation::*;
        assert_eq!(AddIfAbsent.merge(Replace), AddIfAbsent);
        assert_eq!(Replace.merge(Replace), Replace);
        assert_eq!(Replace.merge(AddIfAbsent), Replace);
    }

    #[test]
    fn test_cross_dc_merge_keeps_strictest() {
        use CrossDcMessageStatus::*;
        assert_eq!(NotNeeded.merge(Async), Async);
        assert_eq!(Async.merge(Sync), Sync);
        assert_eq!(Sync.merge(NotNeeded), Sync);
    }

    #[test]
    fn test_tasks_run_in_order() {
        let tasks = vec![
            SessionUpdateTask::replace(|v: &mut Vec<u8>| v.push(1)),
            SessionUpdateTask::add_if_absent(),
            SessionUpdateTask::replace(|v: &mut Vec<u8>| v.push(2)),
        ];
        let mut entity = Vec::new();

        run_all(&tasks, &mut entity);
        // Re-running on a fresh copy gives the same result
        let mut fresh = Vec::new();
        run_all(&tasks, &mut fresh);

        assert_eq!(entity, vec![1, 2]);
        assert_eq!(fresh, entity);
    }

    #[test]
    fn test_default_status_is_sync() {
        let task: SessionUpdateTask<()> = SessionUpdateTask::remove();
        assert_eq!(task.cross_dc(), CrossDcMessageStatus::Sync);
        assert_eq!(
            task.with_cross_dc(CrossDcMessageStatus::Async).cross_dc(),
            CrossDcMessageStatus::Async
        );
    }
}
