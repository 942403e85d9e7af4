//! Cache topology records
//!
//! A [`CacheTopology`] is the versioned pair of consistent hashes a cache
//! routes by: the `current` hash clients use today and, while a rebalance is
//! in flight, the `pending` hash state is being transferred toward.

use crate::hash::{ConsistentHash, ConsistentHashFactory};
use crate::config::PolicyConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Opaque identity of a cluster member
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Static parameters a cache supplies when its first node joins.
///
/// Immutable after creation. The hash-function identity is carried opaquely;
/// key-to-segment mapping happens outside the policy engine.
#[derive(Clone)]
pub struct CacheJoinInfo {
    hash_fn: String,
    num_owners: usize,
    num_segments: usize,
    factory: Arc<dyn ConsistentHashFactory>,
}

impl CacheJoinInfo {
    pub fn new(
        hash_fn: impl Into<String>,
        num_owners: usize,
        num_segments: usize,
        factory: Arc<dyn ConsistentHashFactory>,
    ) -> Self {
        Self {
            hash_fn: hash_fn.into(),
            num_owners,
            num_segments,
            factory,
        }
    }

    /// Join parameters from the policy-wide defaults
    pub fn with_defaults(config: &PolicyConfig, factory: Arc<dyn ConsistentHashFactory>) -> Self {
        Self::new(
            "default",
            config.default_num_owners,
            config.default_num_segments,
            factory,
        )
    }

    pub fn hash_fn(&self) -> &str {
        &self.hash_fn
    }

    pub fn num_owners(&self) -> usize {
        self.num_owners
    }

    pub fn num_segments(&self) -> usize {
        self.num_segments
    }

    pub fn factory(&self) -> &Arc<dyn ConsistentHashFactory> {
        &self.factory
    }
}

impl fmt::Debug for CacheJoinInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheJoinInfo")
            .field("hash_fn", &self.hash_fn)
            .field("num_owners", &self.num_owners)
            .field("num_segments", &self.num_segments)
            .finish()
    }
}

/// Versioned topology of a single cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheTopology {
    /// Strictly increasing per cache across successful transitions
    pub topology_id: i64,

    /// The hash clients route by; `None` until the first member joins
    pub current: Option<ConsistentHash>,

    /// Target hash of an in-flight rebalance; at most one at a time
    pub pending: Option<ConsistentHash>,
}

impl CacheTopology {
    /// Topology id of a cache before its first member joins
    pub const INITIAL_ID: i64 = -1;

    pub fn new(
        topology_id: i64,
        current: Option<ConsistentHash>,
        pending: Option<ConsistentHash>,
    ) -> Self {
        Self {
            topology_id,
            current,
            pending,
        }
    }

    /// The empty topology a cache starts with
    pub fn empty() -> Self {
        Self::new(Self::INITIAL_ID, None, None)
    }

    /// Effective member set: pending members first, then any current members
    /// not also pending
    pub fn members(&self) -> Vec<Address> {
        match (&self.pending, &self.current) {
            (Some(pending), Some(current)) => {
                let mut members = pending.members().to_vec();
                for member in current.members() {
                    if !members.contains(member) {
                        members.push(member.clone());
                    }
                }
                members
            }
            (Some(pending), None) => pending.members().to_vec(),
            (None, Some(current)) => current.members().to_vec(),
            (None, None) => Vec::new(),
        }
    }

    pub fn is_rebalance_in_progress(&self) -> bool {
        self.pending.is_some()
    }
}
