//! Parallel topology queries and the writer role derived from them

use crate::{Error, Rank, Result, ShardCoords};
use serde::{Deserialize, Serialize};

/// A rank's position in the data/tensor/pipeline parallel grid.
///
/// Resolving coordinates is the job of whatever launched the process group;
/// checkpointing only consumes the answers.
pub trait RankTopology: Send + Sync {
    /// Global rank of this process
    fn global_rank(&self) -> Rank;

    /// Total number of processes
    fn world_size(&self) -> usize;

    fn tensor_parallel_rank(&self) -> Rank;
    fn tensor_parallel_size(&self) -> usize;

    fn pipeline_parallel_rank(&self) -> Rank;
    fn pipeline_parallel_size(&self) -> usize;

    fn data_parallel_rank(&self) -> Rank;
    fn data_parallel_size(&self) -> usize;

    /// Coordinates identifying this rank's checkpoint shard
    fn shard_coords(&self) -> ShardCoords {
        ShardCoords {
            tensor_rank: self.tensor_parallel_rank(),
            pipeline_rank: self.pipeline_parallel_rank(),
            pipeline_size: self.pipeline_parallel_size(),
        }
    }
}

/// Fixed topology with explicit coordinates
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StaticTopology {
    pub global_rank: Rank,
    pub tensor_rank: Rank,
    pub tensor_size: usize,
    pub pipeline_rank: Rank,
    pub pipeline_size: usize,
    pub data_rank: Rank,
    pub data_size: usize,
}

impl StaticTopology {
    /// Topology of a single process with no parallelism
    pub fn single() -> Self {
        Self {
            global_rank: 0,
            tensor_rank: 0,
            tensor_size: 1,
            pipeline_rank: 0,
            pipeline_size: 1,
            data_rank: 0,
            data_size: 1,
        }
    }

    /// Derive coordinates from a global rank.
    ///
    /// Ranks are laid out tensor-parallel fastest, then data-parallel, then
    /// pipeline-parallel: `rank = tp + tp_size * (dp + dp_size * pp)`.
    pub fn from_global_rank(
        global_rank: Rank,
        tensor_size: usize,
        pipeline_size: usize,
        data_size: usize,
    ) -> Result<Self> {
        if tensor_size == 0 || pipeline_size == 0 || data_size == 0 {
            return Err(Error::InvalidTopology {
                message: format!(
                    "parallel sizes must be positive (tp={}, pp={}, dp={})",
                    tensor_size, pipeline_size, data_size
                ),
            });
        }

        let world_size = tensor_size * pipeline_size * data_size;
        if global_rank >= world_size {
            return Err(Error::InvalidTopology {
                message: format!(
                    "rank {} out of range for world size {}",
                    global_rank, world_size
                ),
            });
        }

        Ok(Self {
            global_rank,
            tensor_rank: global_rank % tensor_size,
            tensor_size,
            data_rank: (global_rank / tensor_size) % data_size,
            data_size,
            pipeline_rank: global_rank / (tensor_size * data_size),
            pipeline_size,
        })
    }
}

impl RankTopology for StaticTopology {
    fn global_rank(&self) -> Rank {
        self.global_rank
    }

    fn world_size(&self) -> usize {
        self.tensor_size * self.pipeline_size * self.data_size
    }

    fn tensor_parallel_rank(&self) -> Rank {
        self.tensor_rank
    }

    fn tensor_parallel_size(&self) -> usize {
        self.tensor_size
    }

    fn pipeline_parallel_rank(&self) -> Rank {
        self.pipeline_rank
    }

    fn pipeline_parallel_size(&self) -> usize {
        self.pipeline_size
    }

    fn data_parallel_rank(&self) -> Rank {
        self.data_rank
    }

    fn data_parallel_size(&self) -> usize {
        self.data_size
    }
}

/// Which writes this rank is responsible for, resolved once per run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterRole {
    /// Writes its shard's checkpoint blob (data-parallel rank 0)
    primary_writer: bool,

    /// Writes the tracker and emits progress messages (global rank 0)
    global_primary: bool,

    rank: Rank,
}

impl WriterRole {
    /// Resolve the role from the rank's topology
    pub fn resolve(topology: &dyn RankTopology) -> Self {
        Self {
            primary_writer: topology.data_parallel_rank() == 0,
            global_primary: topology.global_rank() == 0,
            rank: topology.global_rank(),
        }
    }

    pub fn is_primary_writer(&self) -> bool {
        self.primary_writer
    }

    pub fn is_global_primary(&self) -> bool {
        self.global_primary
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }
}
