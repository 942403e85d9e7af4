//! Default consistent-hash factory
//!
//! Deterministic segment assignment without any external hashing: the member
//! list order is the only input. `create` spreads owners round-robin,
//! `rebalance` first fills under-owned segments from the least-loaded members
//! and then levels per-member load to a fixpoint, which makes it idempotent.

use super::{ConsistentHash, ConsistentHashFactory};
use crate::error::{Result, TopologyError};
use crate::topology::Address;

/// Factory producing deterministic, evenly spread assignments
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHashFactory;

impl DefaultHashFactory {
    fn dedup_members(members: &[Address]) -> Vec<Address> {
        let mut unique = Vec::with_capacity(members.len());
        for member in members {
            if !unique.contains(member) {
                unique.push(member.clone());
            }
        }
        unique
    }
}

impl ConsistentHashFactory for DefaultHashFactory {
    fn create(
        &self,
        num_owners: usize,
        num_segments: usize,
        members: &[Address],
    ) -> Result<ConsistentHash> {
        let members = Self::dedup_members(members);
        if members.is_empty() {
            return Err(TopologyError::NoMembers);
        }
        let want = num_owners.min(members.len());
        let segment_owners = (0..num_segments)
            .map(|segment| {
                (0..want)
                    .map(|slot| members[(segment + slot) % members.len()].clone())
                    .collect()
            })
            .collect();
        ConsistentHash::new(num_owners, num_segments, members, segment_owners)
    }

    fn update_members(
        &self,
        ch: &ConsistentHash,
        new_members: &[Address],
    ) -> Result<ConsistentHash> {
        let members = Self::dedup_members(new_members);
        if members.is_empty() {
            return Err(TopologyError::NoMembers);
        }
        let segment_owners = (0..ch.num_segments())
            .map(|segment| {
                let kept: Vec<Address> = ch
                    .owners(segment)
                    .iter()
                    .filter(|owner| members.contains(owner))
                    .cloned()
                    .collect();
                if kept.is_empty() {
                    // orphaned segment: deterministic reassignment keeps the
                    // one-owner-per-segment invariant until the next rebalance
                    vec![members[segment % members.len()].clone()]
                } else {
                    kept
                }
            })
            .collect();
        ConsistentHash::new(ch.num_owners(), ch.num_segments(), members, segment_owners)
    }

    fn union(&self, a: &ConsistentHash, b: &ConsistentHash) -> Result<ConsistentHash> {
        if a.num_segments() != b.num_segments() {
            return Err(TopologyError::SegmentCountMismatch {
                left: a.num_segments(),
                right: b.num_segments(),
            });
        }
        let num_owners = a.num_owners().max(b.num_owners());
        let mut members = a.members().to_vec();
        for member in b.members() {
            if !members.contains(member) {
                members.push(member.clone());
            }
        }
        let segment_owners = (0..a.num_segments())
            .map(|segment| {
                let mut owners = a.owners(segment).to_vec();
                for owner in b.owners(segment) {
                    if !owners.contains(owner) {
                        owners.push(owner.clone());
                    }
                }
                owners
            })
            .collect();
        ConsistentHash::new(num_owners, a.num_segments(), members, segment_owners)
    }

    fn rebalance(&self, ch: &ConsistentHash) -> Result<ConsistentHash> {
        let members = ch.members().to_vec();
        let want = ch.num_owners().min(members.len());
        let num_segments = ch.num_segments();

        // Keep surviving ownership, trimmed to the target owner count.
        let mut segment_owners: Vec<Vec<Address>> = (0..num_segments)
            .map(|segment| {
                let mut kept = ch.owners(segment).to_vec();
                kept.truncate(want);
                kept
            })
            .collect();

        let mut loads: Vec<usize> = members
            .iter()
            .map(|member| {
                segment_owners
                    .iter()
                    .filter(|owners| owners.contains(member))
                    .count()
            })
            .collect();

        // Fill under-owned segments from the least-loaded members.
        for owners in segment_owners.iter_mut() {
            while owners.len() < want {
                let candidate = members
                    .iter()
                    .enumerate()
                    .filter(|(_, member)| !owners.contains(member))
                    .min_by_key(|(index, _)| (loads[*index], *index));
                match candidate {
                    Some((index, member)) => {
                        owners.push(member.clone());
                        loads[index] += 1;
                    }
                    None => break,
                }
            }
        }

        // Level load: move single segments from the most-loaded member to the
        // least-loaded one until no move narrows the spread. Each move strictly
        // reduces the load variance, so the loop terminates, and a levelled
        // hash admits no moves, which makes the whole operation idempotent.
        loop {
            let mut donors: Vec<usize> = (0..members.len()).collect();
            donors.sort_by_key(|&index| (usize::MAX - loads[index], index));
            let mut recipients: Vec<usize> = (0..members.len()).collect();
            recipients.sort_by_key(|&index| (loads[index], index));

            let mut found = None;
            'search: for &donor in &donors {
                for &recipient in &recipients {
                    if loads[donor] <= loads[recipient] + 1 {
                        continue;
                    }
                    let movable = (0..num_segments).find(|&segment| {
                        segment_owners[segment].contains(&members[donor])
                            && !segment_owners[segment].contains(&members[recipient])
                    });
                    if let Some(segment) = movable {
                        found = Some((segment, donor, recipient));
                        break 'search;
                    }
                }
            }

            let Some((segment, donor, recipient)) = found else {
                break;
            };
            if let Some(slot) = segment_owners[segment]
                .iter()
                .position(|owner| owner == &members[donor])
            {
                segment_owners[segment][slot] = members[recipient].clone();
                loads[donor] -= 1;
                loads[recipient] += 1;
            }
        }

        ConsistentHash::new(ch.num_owners(), num_segments, members, segment_owners)
    }
}
