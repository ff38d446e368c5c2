//! Session key generation
//!
//! New session ids are random UUIDs. When a partition map is known the
//! generator prefers ids whose primary owner is the local node, so the
//! creating node also owns the new session.

use tracing::trace;
use uuid::Uuid;

use crate::remote::TopologyInfo;

/// Candidates tried before accepting a key owned elsewhere.
const MAX_AFFINITY_ATTEMPTS: u32 = 32;

pub trait KeyGenerator: Send + Sync {
    fn generate_key_string(&self) -> String;

    fn generate_key_uuid(&self) -> Uuid;
}

#[derive(Debug, Clone)]
pub struct ClusterKeyGenerator {
    topology: TopologyInfo,
}

impl ClusterKeyGenerator {
    pub fn new(topology: TopologyInfo) -> Self {
        Self { topology }
    }

    fn generate_owned(&self) -> Uuid {
        let mut candidate = Uuid::new_v4();
        for attempt in 1..MAX_AFFINITY_ATTEMPTS {
            if self.topology.am_i_owner(&candidate.to_string()) {
                trace!(node = %self.topology.node_name(), attempt, "generated locally owned key");
                return candidate;
            }
            candidate = Uuid::new_v4();
        }
        candidate
    }
}

impl KeyGenerator for ClusterKeyGenerator {
    fn generate_key_string(&self) -> String {
        self.generate_owned().to_string()
    }

    fn generate_key_uuid(&self) -> Uuid {
        self.generate_owned()
    }
}
