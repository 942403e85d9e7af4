//! Policy configuration

use serde::{Deserialize, Serialize};

/// Configuration for the rebalance policy engine
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolicyConfig {
    /// Automatically rebalance caches on membership changes.
    /// Can be toggled at runtime via `RebalancePolicy::set_rebalancing_enabled`.
    #[serde(default = "default_auto_rebalance")]
    pub auto_rebalance: bool,

    /// Number of owners per segment for caches that do not specify one
    #[serde(default = "default_num_owners")]
    pub default_num_owners: usize,

    /// Number of hash-space segments for caches that do not specify one
    #[serde(default = "default_num_segments")]
    pub default_num_segments: usize,
}

fn default_auto_rebalance() -> bool {
    true
}

fn default_num_owners() -> usize {
    2
}

fn default_num_segments() -> usize {
    256
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            auto_rebalance: default_auto_rebalance(),
            default_num_owners: default_num_owners(),
            default_num_segments: default_num_segments(),
        }
    }
}
