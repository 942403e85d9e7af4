//! Topology-specific error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while coordinating cache topologies
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum TopologyError {
    #[error(
        "stale rebalance confirmation for cache {cache}: received topology id {received}, \
         outstanding id {expected}"
    )]
    StaleRebalanceConfirmation {
        cache: String,
        expected: i64,
        received: i64,
    },

    #[error("segment count mismatch: {left} vs {right}")]
    SegmentCountMismatch { left: usize, right: usize },

    #[error("consistent hash requires at least one member")]
    NoMembers,

    #[error("invalid consistent hash: {0}")]
    InvalidHash(String),
}

impl TopologyError {
    /// Get the error type as a string for metrics labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            TopologyError::StaleRebalanceConfirmation { .. } => "stale_confirmation",
            TopologyError::SegmentCountMismatch { .. } => "segment_count_mismatch",
            TopologyError::NoMembers => "no_members",
            TopologyError::InvalidHash(_) => "invalid_hash",
        }
    }
}

pub type Result<T> = std::result::Result<T, TopologyError>;
