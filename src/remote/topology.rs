//! Cluster topology
//!
//! Node and site identity, plus the partition ownership used to pick which
//! node of a site applies a remote store notification.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;
use twox_hash::XxHash64;

// == Partition Ownership ==
/// Decides the primary owner node of a key.
pub trait PartitionOwnership: Send + Sync {
    /// Primary owner of `key`, or None when running without a cluster.
    fn primary_owner(&self, key: &str) -> Option<String>;
}

/// Single-node mode: this node owns everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalOwnership;

impl PartitionOwnership for LocalOwnership {
    fn primary_owner(&self, _key: &str) -> Option<String> {
        None
    }
}

/// Highest-random-weight hashing over the member list.
///
/// Each node computes the same owner for a key from the same member list, and
/// a membership change moves only the keys of the joining or leaving node.
#[derive(Debug, Default)]
pub struct RendezvousOwnership {
    members: RwLock<Vec<String>>,
}

impl RendezvousOwnership {
    pub fn new<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ownership = Self::default();
        ownership.set_members(members);
        ownership
    }

    /// Replaces the member list after a view change.
    pub fn set_members<I, S>(&self, members: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut members: Vec<String> = members.into_iter().map(Into::into).collect();
        members.sort();
        members.dedup();
        *self.members.write() = members;
    }

    pub fn members(&self) -> Vec<String> {
        self.members.read().clone()
    }

    fn weight(member: &str, key: &str) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        member.hash(&mut hasher);
        key.hash(&mut hasher);
        hasher.finish()
    }
}

impl PartitionOwnership for RendezvousOwnership {
    fn primary_owner(&self, key: &str) -> Option<String> {
        self.members
            .read()
            .iter()
            .max_by_key(|member| Self::weight(member, key))
            .cloned()
    }
}

// == Topology Info ==
#[derive(Clone)]
pub struct TopologyInfo {
    node_name: String,
    site_name: Option<String>,
    ownership: Arc<dyn PartitionOwnership>,
}

impl std::fmt::Debug for TopologyInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyInfo")
            .field("node_name", &self.node_name)
            .field("site_name", &self.site_name)
            .finish()
    }
}

impl TopologyInfo {
    pub fn new(
        node_name: impl Into<String>,
        site_name: Option<String>,
        ownership: Arc<dyn PartitionOwnership>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            site_name,
            ownership,
        }
    }

    /// Single node without a cluster.
    pub fn local(node_name: impl Into<String>, site_name: Option<String>) -> Self {
        Self::new(node_name, site_name, Arc::new(LocalOwnership))
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn site_name(&self) -> Option<&str> {
        self.site_name.as_deref()
    }

    // == Ownership ==
    /// True if this node is the primary owner of `key`.
    pub fn am_i_owner(&self, key: &str) -> bool {
        match self.ownership.primary_owner(key) {
            Some(owner) => owner == self.node_name,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_mode_owns_everything() {
        let topology = TopologyInfo::local("node-a", None);
        assert!(topology.am_i_owner("any-key"));
        assert_eq!(topology.site_name(), None);
    }

    #[test]
    fn test_exactly_one_member_owns_each_key() {
        let ownership: Arc<dyn PartitionOwnership> =
            Arc::new(RendezvousOwnership::new(["node-a", "node-b", "node-c"]));
        let nodes: Vec<TopologyInfo> = ["node-a", "node-b", "node-c"]
            .iter()
            .map(|name| TopologyInfo::new(*name, Some("site-1".into()), ownership.clone()))
            .collect();

        for i in 0..100 {
            let key = format!("session-{}", i);
            let owners = nodes.iter().filter(|node| node.am_i_owner(&key)).count();
            assert_eq!(owners, 1, "key {} should have one owner", key);
        }
    }

    #[test]
    fn test_owner_is_stable_across_member_order() {
        let a = RendezvousOwnership::new(["x", "y", "z"]);
        let b = RendezvousOwnership::new(["z", "x", "y"]);

        for i in 0..50 {
            let key = i.to_string();
            assert_eq!(a.primary_owner(&key), b.primary_owner(&key));
        }
    }

    #[test]
    fn test_removing_member_moves_only_its_keys() {
        let ownership = RendezvousOwnership::new(["x", "y", "z"]);
        let before: Vec<Option<String>> =
            (0..100).map(|i| ownership.primary_owner(&i.to_string())).collect();

        ownership.set_members(["x", "y"]);

        for (i, owner) in before.iter().enumerate() {
            if owner.as_deref() != Some("z") {
                assert_eq!(&ownership.primary_owner(&i.to_string()), owner);
            }
        }
        assert!(RendezvousOwnership::default().primary_owner("k").is_none());
    }
}
