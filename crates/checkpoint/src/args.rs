//! Run-argument snapshots stored in checkpoints
//!
//! A checkpoint records the arguments of the run that wrote it. On load the
//! structural fields are compared against the current run (a mismatch means
//! the checkpoint belongs to a different architecture) and the consumed
//! sample counters are carried forward so data iteration resumes in place.

use runtime_core::{CheckpointVersion, Error, Result, TrainingArgs};

use crate::state::StateValue;

/// A structural argument and the name older checkpoints used for it
#[derive(Debug, Clone, Copy)]
pub struct ArgField {
    pub name: &'static str,
    /// Name used by checkpoints older than [`CheckpointVersion::CURRENT`]
    pub legacy_name: Option<&'static str>,
}

impl ArgField {
    const fn new(name: &'static str) -> Self {
        Self {
            name,
            legacy_name: None,
        }
    }

    const fn renamed(name: &'static str, legacy_name: &'static str) -> Self {
        Self {
            name,
            legacy_name: Some(legacy_name),
        }
    }

    /// Name to read from a snapshot written with `version`
    pub fn snapshot_name(&self, version: CheckpointVersion) -> &'static str {
        match self.legacy_name {
            Some(legacy) if version < CheckpointVersion::CURRENT => legacy,
            _ => self.name,
        }
    }
}

/// Arguments that must match between the saving and the loading run
pub const STRUCTURAL_FIELDS: &[ArgField] = &[
    ArgField::new("num_layers"),
    ArgField::new("hidden_size"),
    ArgField::new("num_attention_heads"),
    ArgField::new("max_position_embeddings"),
    ArgField::new("vocab_size"),
    ArgField::renamed("tensor_model_parallel_size", "model_parallel_size"),
    ArgField::new("pipeline_model_parallel_size"),
];

/// Snapshot the run arguments for storage in a checkpoint
pub fn snapshot(args: &TrainingArgs) -> Result<StateValue> {
    let json = serde_json::to_value(args)?;
    Ok(StateValue::from(&json))
}

/// Fail if the checkpoint was written for a different architecture
pub fn check_checkpoint_args(
    snapshot: &StateValue,
    args: &TrainingArgs,
    version: CheckpointVersion,
    path: &str,
) -> Result<()> {
    let current = serde_json::to_value(args)?;

    for field in STRUCTURAL_FIELDS {
        let stored_name = field.snapshot_name(version);
        let checkpoint_value = snapshot
            .get(stored_name)
            .and_then(StateValue::as_u64)
            .ok_or_else(|| Error::MalformedCheckpoint {
                path: path.to_string(),
                field: format!("args.{}", stored_name),
            })?;
        let current_value = current
            .get(field.name)
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| Error::Internal {
                message: format!("run arguments have no numeric field `{}`", field.name),
            })?;

        if checkpoint_value != current_value {
            return Err(Error::ConfigMismatch {
                field: field.name.to_string(),
                checkpoint_value: checkpoint_value.to_string(),
                current_value: current_value.to_string(),
            });
        }
    }

    Ok(())
}

/// Carry the consumed-sample counters of the snapshot into the live run
pub fn restore_consumed_samples(snapshot: &StateValue, args: &mut TrainingArgs) {
    let counter = |name: &str| snapshot.get(name).and_then(StateValue::as_u64).unwrap_or(0);
    args.consumed_train_samples = counter("consumed_train_samples");
    args.consumed_valid_samples = counter("consumed_valid_samples");
}
