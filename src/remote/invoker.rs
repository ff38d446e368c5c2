//! Remote cache invoker
//!
//! Forwards committed session changes to the remote store. Every remote call
//! runs under the retry policy; a version conflict on replace re-reads the
//! remote entity and re-runs the tasks on it.

use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::cache::Expiration;
use crate::changes::{run_all, CacheOperation, SessionUpdateTask};
use crate::error::{CacheError, RemoteStoreError, Result};
use crate::models::SessionEntity;
use crate::remote::{RemoteStore, RetryPolicy};

pub struct RemoteCacheInvoker {
    remote: Arc<dyn RemoteStore>,
    policy: RetryPolicy,
    replace_retries: u32,
}

impl RemoteCacheInvoker {
    /// # Arguments
    /// * `remote` - Remote store mirroring one region
    /// * `policy` - Retry policy for transient failures of single calls
    /// * `replace_retries` - Bound on version-conflict retries of a replace
    pub fn new(remote: Arc<dyn RemoteStore>, policy: RetryPolicy, replace_retries: u32) -> Self {
        Self {
            remote,
            policy,
            replace_retries: replace_retries.max(1),
        }
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn store_name(&self) -> &str {
        self.remote.name()
    }

    fn call<T, F>(&self, op_name: &str, op: F) -> Result<T>
    where
        F: FnMut(u32) -> std::result::Result<T, RemoteStoreError>,
    {
        self.policy
            .execute(op_name, op)
            .map_err(|exhausted| CacheError::RemoteExhausted {
                store: self.remote.name().to_string(),
                attempts: exhausted.attempts,
                source: exhausted.last_error,
            })
    }

    // == Reads ==
    /// Fetches and decodes an entity together with its remote version.
    pub fn get<V: DeserializeOwned>(&self, key: &str) -> Result<Option<(V, u64)>> {
        let Some(found) = self.call("get", |_| self.remote.get_with_version(key))? else {
            return Ok(None);
        };
        let entity = serde_json::from_slice(&found.value)?;
        Ok(Some((entity, found.version)))
    }

    // == Writes ==
    /// Unconditional write, used by imports.
    pub fn put<V: Serialize>(&self, key: &str, entity: &V, expiration: Expiration) -> Result<()> {
        let payload = encode(entity)?;
        self.call("put", |_| self.remote.put(key, payload.clone(), expiration))?;
        Ok(())
    }

    /// Applies one committed change to the remote store.
    ///
    /// # Arguments
    /// * `key` - Remote key of the entity
    /// * `operation` - Merged operation of the committed tasks
    /// * `tasks` - Tasks to re-run if the remote copy has to be replaced
    /// * `entity` - Entity as committed locally
    /// * `expiration` - TTLs computed for the local write
    pub fn run_task<V: SessionEntity>(
        &self,
        key: &str,
        operation: CacheOperation,
        tasks: &[SessionUpdateTask<V>],
        entity: &V,
        expiration: Expiration,
    ) -> Result<()> {
        match operation {
            CacheOperation::Remove => {
                self.call("remove", |_| self.remote.remove(key))?;
                trace!(store = %self.store_name(), key, "removed remote entity");
                Ok(())
            }
            CacheOperation::AddIfAbsent => {
                let payload = encode(entity)?;
                let existing = self.call("putIfAbsent", |_| {
                    self.remote.put_if_absent(key, payload.clone(), expiration)
                })?;
                if existing.is_some() {
                    debug!(
                        store = %self.store_name(),
                        key,
                        "Existing entity in remote store, will update it",
                    );
                    return self.replace(key, tasks, expiration);
                }
                Ok(())
            }
            CacheOperation::Replace => self.replace(key, tasks, expiration),
        }
    }

    fn replace<V: SessionEntity>(
        &self,
        key: &str,
        tasks: &[SessionUpdateTask<V>],
        expiration: Expiration,
    ) -> Result<()> {
        for attempt in 0..self.replace_retries {
            let Some(current) = self.call("get", |_| self.remote.get_with_version(key))? else {
                warn!(
                    store = %self.store_name(),
                    key,
                    "Entity to replace not found in remote store",
                );
                return Ok(());
            };

            let mut entity: V = serde_json::from_slice(&current.value)?;
            run_all(tasks, &mut entity);
            let payload = encode(&entity)?;

            let replaced = self.call("replaceWithVersion", |_| {
                self.remote
                    .replace_with_version(key, payload.clone(), current.version, expiration)
            })?;
            if replaced {
                trace!(
                    store = %self.store_name(),
                    key,
                    version = current.version,
                    "replaced remote entity",
                );
                return Ok(());
            }
            debug!(
                store = %self.store_name(),
                key,
                attempt,
                "Remote version conflict, retrying replace"
            );
        }

        warn!(
            store = %self.store_name(),
            key,
            retries = self.replace_retries,
            "Failed to replace remote entity, giving up"
        );
        Ok(())
    }
}

fn encode<V: Serialize>(entity: &V) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(entity)?))
}
