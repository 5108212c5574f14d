//! Runtime Core - Foundation for training checkpoint coordination
//!
//! Provides core types, error handling, configuration, parallel topology
//! and the collective operations ranks use to stay in lock-step.

pub mod collective;
pub mod config;
pub mod error;
pub mod session;
pub mod topology;
pub mod types;

pub use collective::{Collective, CollectiveOp, LocalGroup, LocalGroupMember, SingleProcess};
pub use config::{CheckpointConfig, RuntimeConfig, TrainingArgs};
pub use error::{Error, Result};
pub use session::CheckpointSession;
pub use topology::{RankTopology, StaticTopology, WriterRole};
pub use types::*;
