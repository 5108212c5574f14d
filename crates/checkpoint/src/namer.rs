//! Canonical on-disk names for checkpoint shards
//!
//! ```text
//! <root>/iter_0000100/mp_rank_01/model_optim_rng.ckpt               pipeline size 1
//! <root>/iter_0000100/mp_rank_01_pp_rank_002/model_optim_rng.ckpt   pipeline size > 1
//! <root>/release/mp_rank_01/model_optim_rng.ckpt                    release checkpoint
//! <root>/iter_0000100_mp_rank_01/complete_model_optim.ckpt          complete, pipeline size 1
//! ```
//!
//! Ranks are zero-padded so directory listings sort by rank. The pipeline
//! rank is only part of the name when there is more than one stage.

use runtime_core::{Iteration, ShardCoords};
use std::fmt;
use std::path::{Path, PathBuf};

/// File extension of checkpoint shards
pub const CHECKPOINT_EXTENSION: &str = "ckpt";

/// Directory used for release checkpoints
pub const RELEASE_DIR: &str = "release";

const SHARD_FILE_STEM: &str = "model_optim_rng";
const COMPLETE_FILE_STEM: &str = "complete_model_optim";

/// Which checkpoint of a run a name refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointTag {
    /// Checkpoint saved at a training iteration
    Iteration(Iteration),

    /// Released weights; semantically iteration 0
    Release,
}

impl CheckpointTag {
    pub fn new(iteration: Iteration, release: bool) -> Self {
        if release {
            CheckpointTag::Release
        } else {
            CheckpointTag::Iteration(iteration)
        }
    }

    pub fn is_release(&self) -> bool {
        matches!(self, CheckpointTag::Release)
    }

    pub fn iteration(&self) -> Iteration {
        match self {
            CheckpointTag::Iteration(iteration) => *iteration,
            CheckpointTag::Release => 0,
        }
    }

    /// Directory holding every shard of this checkpoint
    pub fn directory(&self) -> String {
        match self {
            CheckpointTag::Iteration(iteration) => iteration_dir(*iteration),
            CheckpointTag::Release => RELEASE_DIR.to_string(),
        }
    }
}

impl fmt::Display for CheckpointTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointTag::Iteration(iteration) => write!(f, "iteration {}", iteration),
            CheckpointTag::Release => write!(f, "release"),
        }
    }
}

fn iteration_dir(iteration: Iteration) -> String {
    format!("iter_{:07}", iteration)
}

/// Identity of one shard of one checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CheckpointIdentity {
    pub tag: CheckpointTag,
    /// Iteration embedded in complete-export names, kept even for release tags
    pub iteration: Iteration,
    pub coords: ShardCoords,
    /// Full (unsharded) model export rather than a training shard
    pub complete: bool,
}

impl CheckpointIdentity {
    pub fn new(tag: CheckpointTag, coords: ShardCoords) -> Self {
        Self {
            tag,
            iteration: tag.iteration(),
            coords,
            complete: false,
        }
    }

    /// Override the iteration written into complete-export names
    pub fn at_iteration(mut self, iteration: Iteration) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn complete(mut self) -> Self {
        self.complete = true;
        self
    }

    /// Path relative to the checkpoint root, `/`-separated
    pub fn relative_path(&self) -> String {
        let tensor_rank = self.coords.tensor_rank;

        if !self.coords.has_pipeline() {
            if self.complete {
                // Complete exports bypass the iteration directory
                return format!(
                    "{}_mp_rank_{:02}/{}.{}",
                    iteration_dir(self.iteration),
                    tensor_rank,
                    COMPLETE_FILE_STEM,
                    CHECKPOINT_EXTENSION
                );
            }
            return format!(
                "{}/mp_rank_{:02}/{}.{}",
                self.tag.directory(),
                tensor_rank,
                SHARD_FILE_STEM,
                CHECKPOINT_EXTENSION
            );
        }

        let pipeline_rank = self.coords.pipeline_rank;
        if self.complete {
            return format!(
                "{}/{}_mp_rank_{:02}_pp_rank_{:03}/{}.{}",
                self.tag.directory(),
                iteration_dir(self.iteration),
                tensor_rank,
                pipeline_rank,
                COMPLETE_FILE_STEM,
                CHECKPOINT_EXTENSION
            );
        }
        format!(
            "{}/mp_rank_{:02}_pp_rank_{:03}/{}.{}",
            self.tag.directory(),
            tensor_rank,
            pipeline_rank,
            SHARD_FILE_STEM,
            CHECKPOINT_EXTENSION
        )
    }

    /// Absolute path under `root`
    pub fn path(&self, root: &Path) -> PathBuf {
        root.join(self.relative_path())
    }
}

/// Path of a checkpoint shard under `root`
pub fn checkpoint_name(
    root: &Path,
    iteration: Iteration,
    release: bool,
    complete: bool,
    coords: ShardCoords,
) -> PathBuf {
    let identity =
        CheckpointIdentity::new(CheckpointTag::new(iteration, release), coords).at_iteration(iteration);
    if complete {
        identity.complete().path(root)
    } else {
        identity.path(root)
    }
}
