//! Collaborator contracts
//!
//! The policy engine is a library object behind two seams: the cluster
//! topology manager it broadcasts into, and the transport it reads the
//! initial member list from. Membership changes are pushed into the policy
//! via `update_members_list`; rebalance completions come back through
//! `on_rebalance_completed`.

use crate::error::Result;
use crate::topology::{Address, CacheTopology};
use async_trait::async_trait;

/// Broadcast and state-transfer surface of the cluster
#[async_trait]
pub trait ClusterTopologyManager: Send + Sync {
    /// Fire-and-forget fan-out of the latest topology to all members.
    ///
    /// Called with the cache's status mutex held, so implementations must
    /// only enqueue and return.
    fn update_consistent_hash(&self, cache_name: &str, topology: &CacheTopology);

    /// Initiate the cluster-wide state-transfer protocol toward
    /// `topology.pending`. May block; the policy calls it outside any lock.
    /// Completion arrives later via `RebalancePolicy::on_rebalance_completed`.
    async fn rebalance(&self, cache_name: &str, topology: &CacheTopology) -> Result<()>;
}

/// Membership oracle consulted once at policy start
pub trait Transport: Send + Sync {
    fn members(&self) -> Vec<Address>;
}
