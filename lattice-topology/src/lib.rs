//! Lattice Topology - cluster rebalance policy engine for distributed caches
//!
//! This crate coordinates which cluster members own which hash-space segments
//! for every named cache, keeping ownership deterministic as nodes join and
//! leave and driving rebalances whenever the cluster is imbalanced.
//!
//! # Architecture
//!
//! - **Hash**: immutable consistent-hash values plus a factory trait for the
//!   pure transformations (create, update members, union, rebalance)
//! - **Topology**: versioned `(current, pending)` hash pair per cache
//! - **Status**: per-cache state behind a dedicated mutex, the sole ordering
//!   authority for that cache
//! - **Policy**: the event sink wiring membership changes, cache joins and
//!   leaves, and rebalance confirmations into topology transitions
//! - **Manager/Transport**: collaborator traits for broadcasting topologies
//!   and reading the initial member list
//! - **Executor**: async dispatch for rebalance decision jobs
//!
//! # Key operations
//!
//! - `init_cache` / `init_cache_with_topologies`: register a cache, or absorb
//!   sub-cluster topologies after a partition merge
//! - `add_joiners` / `remove_leavers`: per-cache membership
//! - `update_members_list`: reconcile all caches against a new cluster view
//! - `on_rebalance_completed`: promote the pending hash once the cluster
//!   confirms it
//! - `get_topology`: lock-free topology snapshot

pub mod config;
pub mod error;
pub mod executor;
pub mod hash;
pub mod manager;
pub mod metrics;
pub mod policy;
pub mod status;
pub mod topology;

pub use config::PolicyConfig;
pub use error::{Result, TopologyError};
pub use executor::{Job, JobExecutor, TokioExecutor};
pub use hash::{ConsistentHash, ConsistentHashFactory, DefaultHashFactory};
pub use manager::{ClusterTopologyManager, Transport};
pub use policy::RebalancePolicy;
pub use status::CacheStatus;
pub use topology::{Address, CacheJoinInfo, CacheTopology};
