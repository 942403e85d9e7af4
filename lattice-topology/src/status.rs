//! Per-cache mutable state
//!
//! Every cache the policy knows about has one [`CacheStatus`]. The embedded
//! mutex is the sole ordering authority for that cache: all read-modify-write
//! sequences, including the topology broadcast hand-off, run with it held.
//! Readers that only need the latest topology go through a published snapshot
//! that is replaced whole while the mutex is held, so they never contend with
//! an in-flight transition.

use crate::hash::ConsistentHash;
use crate::topology::{Address, CacheJoinInfo, CacheTopology};
use parking_lot::{Mutex, MutexGuard, RwLock};

/// Lock-protected state of a single cache
pub struct CacheStatus {
    cache_name: String,
    join_info: CacheJoinInfo,
    state: Mutex<CacheState>,
    published: RwLock<CacheTopology>,
}

/// The fields guarded by the status mutex
pub(crate) struct CacheState {
    /// Addresses awaiting inclusion, unique, in arrival order
    pub joiners: Vec<Address>,

    /// Latest installed topology
    pub topology: CacheTopology,
}

impl CacheStatus {
    pub fn new(cache_name: impl Into<String>, join_info: CacheJoinInfo) -> Self {
        Self {
            cache_name: cache_name.into(),
            join_info,
            state: Mutex::new(CacheState {
                joiners: Vec::new(),
                topology: CacheTopology::empty(),
            }),
            published: RwLock::new(CacheTopology::empty()),
        }
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn join_info(&self) -> &CacheJoinInfo {
        &self.join_info
    }

    /// Latest topology snapshot; never blocks on the status mutex
    pub fn current_topology(&self) -> CacheTopology {
        self.published.read().clone()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock()
    }

    /// Replace the topology. Callers must hold the status mutex (witnessed by
    /// the `state` borrow); the published snapshot is swapped atomically so
    /// concurrent readers see either the old or the new value.
    pub(crate) fn install(&self, state: &mut CacheState, topology: CacheTopology) {
        state.topology = topology.clone();
        *self.published.write() = topology;
    }
}

impl CacheState {
    /// Append a joiner unless already present; returns whether it was added
    pub fn add_joiner(&mut self, address: Address) -> bool {
        if self.joiners.contains(&address) {
            return false;
        }
        self.joiners.push(address);
        true
    }

    /// Drop every joiner that is now an owner in the given hash
    pub fn remove_joiners_in(&mut self, ch: &ConsistentHash) {
        self.joiners.retain(|joiner| !ch.contains(joiner));
    }
}
