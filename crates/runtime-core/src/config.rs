//! Runtime configuration types

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory under the output root that holds checkpoints
pub const CHECKPOINT_SUBDIR: &str = "ckpt";

/// Main runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Checkpoint settings
    pub checkpoint: CheckpointConfig,

    /// Run arguments snapshotted into every checkpoint
    pub training: TrainingArgs,
}

impl RuntimeConfig {
    /// Load configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| Error::InvalidConfig {
            message: format!("Failed to read {}: {}", path.display(), e),
        })?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Checkpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Output root; checkpoints are saved under `<save_dir>/ckpt`
    pub save_dir: PathBuf,

    /// Checkpoint root to resume from (defaults to the save location)
    pub load_dir: Option<PathBuf>,

    /// Skip optimizer and LR-scheduler state when saving
    pub no_save_optim: bool,

    /// Skip RNG state when saving
    pub no_save_rng: bool,

    /// Skip optimizer and LR-scheduler state when loading
    pub no_load_optim: bool,

    /// Skip RNG state when loading
    pub no_load_rng: bool,

    /// Load weights only and restart training progress at iteration 0
    pub finetune: bool,

    /// Require checkpoint keys to match the model exactly
    pub strict_load: bool,

    /// Upper bound on any single collective wait
    #[serde(with = "humantime_serde")]
    pub barrier_timeout: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            save_dir: PathBuf::from("./output"),
            load_dir: None,
            no_save_optim: false,
            no_save_rng: false,
            no_load_optim: false,
            no_load_rng: false,
            finetune: false,
            strict_load: true,
            barrier_timeout: Duration::from_secs(300),
        }
    }
}

impl CheckpointConfig {
    /// Directory checkpoints are written to
    pub fn checkpoint_root(&self) -> PathBuf {
        self.save_dir.join(CHECKPOINT_SUBDIR)
    }

    /// Directory checkpoints are restored from
    pub fn resume_root(&self) -> PathBuf {
        self.load_dir
            .clone()
            .unwrap_or_else(|| self.checkpoint_root())
    }
}

/// Run arguments that describe the model architecture and data progress.
///
/// Structural fields must match between the run that wrote a checkpoint and
/// the run that loads it; consumed-sample counters are carried forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingArgs {
    pub num_layers: u64,
    pub hidden_size: u64,
    pub num_attention_heads: u64,
    pub max_position_embeddings: u64,
    pub vocab_size: u64,
    pub tensor_model_parallel_size: u64,
    pub pipeline_model_parallel_size: u64,

    /// Training samples consumed so far
    pub consumed_train_samples: u64,

    /// Validation samples consumed so far
    pub consumed_valid_samples: u64,
}

impl Default for TrainingArgs {
    fn default() -> Self {
        Self {
            num_layers: 12,
            hidden_size: 768,
            num_attention_heads: 12,
            max_position_embeddings: 1024,
            vocab_size: 50257,
            tensor_model_parallel_size: 1,
            pipeline_model_parallel_size: 1,
            consumed_train_samples: 0,
            consumed_valid_samples: 0,
        }
    }
}

/// Duration serialization helper for human-readable formats
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
