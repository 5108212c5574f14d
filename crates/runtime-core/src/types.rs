//! Core type definitions for checkpoint coordination

use serde::{Deserialize, Serialize};
use std::fmt;

/// Rank index in the process group
pub type Rank = usize;

/// Training iteration and epoch counters
pub type Iteration = u64;
pub type Epoch = u64;

/// Coordinates that identify which checkpoint shard a rank owns.
///
/// The data-parallel coordinate is deliberately absent: data-parallel
/// replicas hold identical state and share one shard, written by replica 0.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ShardCoords {
    /// Tensor-parallel rank
    pub tensor_rank: usize,

    /// Pipeline-parallel stage rank
    pub pipeline_rank: usize,

    /// Number of pipeline stages
    pub pipeline_size: usize,
}

impl ShardCoords {
    /// Coordinates for a rank in a topology without pipeline parallelism
    pub fn tensor_only(tensor_rank: usize) -> Self {
        Self {
            tensor_rank,
            pipeline_rank: 0,
            pipeline_size: 1,
        }
    }

    /// Whether the pipeline dimension contributes to shard identity
    pub fn has_pipeline(&self) -> bool {
        self.pipeline_size > 1
    }
}

/// Numeric checkpoint format version
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CheckpointVersion(pub u32);

impl CheckpointVersion {
    /// Version written by this implementation
    pub const CURRENT: CheckpointVersion = CheckpointVersion(3);

    /// Assumed when a checkpoint carries no version tag
    pub const LEGACY: CheckpointVersion = CheckpointVersion(0);
}

impl fmt::Display for CheckpointVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
