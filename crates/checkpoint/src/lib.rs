//! Checkpoint save and restore for sharded distributed training
//!
//! Each data-parallel group's rank 0 writes one blob per (tensor, pipeline)
//! shard; global rank 0 then records the iteration in a tracker file. On
//! resume every rank agrees on the iteration to load, restores its shard and
//! waits for the others before training continues.

pub mod args;
pub mod coordinator;
pub mod format;
pub mod inspect;
pub mod namer;
pub mod provider;
pub mod state;
pub mod tracker;

pub use coordinator::{CheckpointCoordinator, ResumePoint, SaveReport};
pub use inspect::{list_shards, ShardEntry};
pub use namer::{checkpoint_name, CheckpointIdentity, CheckpointTag};
pub use provider::{RngStateProvider, StateProvider, TrainingState};
pub use state::{keys, CheckpointState, RngBundle, StateValue, Tensor, TensorData};
pub use tracker::{Reconciled, Tracker, TrackerRecord};
