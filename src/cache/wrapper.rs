//! Versioned Entity Wrapper
//!
//! Pairs an entity with the version the owning store assigned on its last
//! write. Replace operations compare versions, so a wrapper read earlier acts
//! as the expected value of a compare-and-swap.

use std::collections::HashMap;

/// Entity plus store-assigned version and node-local metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEntityWrapper<V> {
    entity: V,
    /// 0 until the wrapper has been written to a store
    version: u64,
    /// Never leaves this node
    local_metadata: HashMap<String, String>,
}

impl<V> SessionEntityWrapper<V> {
    /// Wraps an entity that has not been stored yet.
    pub fn new(entity: V) -> Self {
        Self {
            entity,
            version: 0,
            local_metadata: HashMap::new(),
        }
    }

    /// Wraps an entity while keeping metadata from a previous local wrapper.
    pub fn with_local_metadata(entity: V, local_metadata: HashMap<String, String>) -> Self {
        Self {
            entity,
            version: 0,
            local_metadata,
        }
    }

    pub fn entity(&self) -> &V {
        &self.entity
    }

    pub fn entity_mut(&mut self) -> &mut V {
        &mut self.entity
    }

    pub fn into_entity(self) -> V {
        self.entity
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Only stores assign versions.
    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    pub fn local_metadata(&self) -> &HashMap<String, String> {
        &self.local_metadata
    }

    pub fn local_metadata_note(&self, key: &str) -> Option<&str> {
        self.local_metadata.get(key).map(String::as_str)
    }

    pub fn put_local_metadata_note(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.local_metadata.insert(key.into(), value.into());
    }

    /// Copy suitable for a remote store: the entity alone, without node-local state.
    pub fn for_transport(&self) -> &V {
        &self.entity
    }

    /// Same entity content and version, ignoring local metadata.
    pub fn same_version_as(&self, other: &SessionEntityWrapper<V>) -> bool {
        self.version == other.version
    }
}
