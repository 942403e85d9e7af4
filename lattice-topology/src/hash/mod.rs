//! Consistent-hash abstraction for segment ownership
//!
//! A [`ConsistentHash`] is an immutable assignment of hash-space segments to
//! an ordered list of owning members. All transformations (`create`,
//! `update_members`, `union`, `rebalance`) go through a
//! [`ConsistentHashFactory`] and produce fresh values; a hash is never
//! mutated in place.

mod factory;

pub use factory::DefaultHashFactory;

use crate::error::{Result, TopologyError};
use crate::topology::Address;
use serde::{Deserialize, Serialize};

/// Immutable assignment of segments to owning members.
///
/// Each of the `num_segments` segments is owned by between 1 and
/// `min(members, num_owners)` distinct members. The member list is ordered;
/// the order is supplied externally and stays stable for the lifetime of the
/// value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistentHash {
    num_owners: usize,
    num_segments: usize,
    members: Vec<Address>,
    segment_owners: Vec<Vec<Address>>,
}

impl ConsistentHash {
    /// Build a hash from explicit per-segment owner lists.
    ///
    /// Validates that every segment has at least one owner and that all
    /// owners are distinct members.
    pub fn new(
        num_owners: usize,
        num_segments: usize,
        members: Vec<Address>,
        segment_owners: Vec<Vec<Address>>,
    ) -> Result<Self> {
        if num_owners == 0 || num_segments == 0 {
            return Err(TopologyError::InvalidHash(
                "owner and segment counts must be positive".to_string(),
            ));
        }
        if members.is_empty() {
            return Err(TopologyError::NoMembers);
        }
        if segment_owners.len() != num_segments {
            return Err(TopologyError::InvalidHash(format!(
                "expected {} segments, got {}",
                num_segments,
                segment_owners.len()
            )));
        }
        for (segment, owners) in segment_owners.iter().enumerate() {
            if owners.is_empty() {
                return Err(TopologyError::InvalidHash(format!(
                    "segment {} has no owners",
                    segment
                )));
            }
            for (i, owner) in owners.iter().enumerate() {
                if !members.contains(owner) {
                    return Err(TopologyError::InvalidHash(format!(
                        "segment {} owner {} is not a member",
                        segment, owner
                    )));
                }
                if owners[..i].contains(owner) {
                    return Err(TopologyError::InvalidHash(format!(
                        "segment {} lists owner {} twice",
                        segment, owner
                    )));
                }
            }
        }
        Ok(Self {
            num_owners,
            num_segments,
            members,
            segment_owners,
        })
    }

    /// Configured number of owners per segment
    pub fn num_owners(&self) -> usize {
        self.num_owners
    }

    /// Number of hash-space segments
    pub fn num_segments(&self) -> usize {
        self.num_segments
    }

    /// Ordered member list
    pub fn members(&self) -> &[Address] {
        &self.members
    }

    /// Owners of the given segment, primary first
    pub fn owners(&self, segment: usize) -> &[Address] {
        &self.segment_owners[segment]
    }

    /// Check whether an address is a member of this hash
    pub fn contains(&self, address: &Address) -> bool {
        self.members.contains(address)
    }

    /// Number of segments the given address owns
    pub fn segments_owned_by(&self, address: &Address) -> usize {
        self.segment_owners
            .iter()
            .filter(|owners| owners.contains(address))
            .count()
    }

    /// A hash is balanced when every segment has exactly
    /// `min(members, num_owners)` owners. This predicate is the sole driver
    /// of whether more rebalance work is needed.
    pub fn is_balanced(&self) -> bool {
        let want = self.num_owners.min(self.members.len());
        self.segment_owners.iter().all(|owners| owners.len() == want)
    }
}

/// Provider of the consistent-hash operations for a cache.
///
/// All operations are pure: they never modify their inputs and return fresh
/// hashes. Failures propagate to the policy caller untouched.
pub trait ConsistentHashFactory: Send + Sync {
    /// Build an initial balanced assignment over `members`
    fn create(
        &self,
        num_owners: usize,
        num_segments: usize,
        members: &[Address],
    ) -> Result<ConsistentHash>;

    /// Restrict or extend a hash to `new_members`.
    ///
    /// Surviving owners keep their segments; members not previously in the
    /// hash join the member list owning nothing until the next rebalance. A
    /// segment that loses every owner is reassigned deterministically so the
    /// result always has at least one owner per segment.
    fn update_members(
        &self,
        ch: &ConsistentHash,
        new_members: &[Address],
    ) -> Result<ConsistentHash>;

    /// Merge two hashes segment-wise so that the result owns at least the
    /// union of both owner sets. Order-stable and symmetric on the owner set
    /// per segment.
    fn union(&self, a: &ConsistentHash, b: &ConsistentHash) -> Result<ConsistentHash>;

    /// Produce a balanced hash over the same members. Idempotent:
    /// `rebalance(rebalance(ch)) == rebalance(ch)`.
    fn rebalance(&self, ch: &ConsistentHash) -> Result<ConsistentHash>;
}
