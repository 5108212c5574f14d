//! Checkpoint save and restore across ranks
//!
//! Every rank runs the same sequence of collectives on every call; only the
//! I/O differs by role. Data-parallel rank 0 of each shard writes the blob,
//! global rank 0 writes the tracker between two barriers.

use runtime_core::{
    CheckpointConfig, CheckpointSession, CheckpointVersion, Collective, Epoch, Error, Iteration,
    RankTopology, Result, ShardCoords, TrainingArgs, WriterRole,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use storage::{LocalStorage, StorageBackend};
use tracing::{debug, info, warn};

use crate::args;
use crate::format;
use crate::namer::{CheckpointIdentity, CheckpointTag};
use crate::provider::{load_unwrapped, unwrap_model, TrainingState};
use crate::state::{keys, CheckpointState, RngBundle, StateValue};
use crate::tracker::{self, Tracker};

const OPTIMIZER_HINT: &str = "Set no_load_optim or finetune to skip loading the optimizer state";
const RNG_HINT: &str = "Set no_load_rng or finetune to skip loading the rng state";
const MODEL_HINT: &str = "The checkpoint does not hold weights for every model chunk of this run";

/// Result of a save on one rank
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReport {
    pub iteration: Iteration,
    /// Shard written by this rank; `None` for data-parallel replicas
    pub path: Option<PathBuf>,
    pub size_bytes: u64,
}

/// Where training resumes after a load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePoint {
    pub iteration: Iteration,
    pub epoch: Epoch,
    /// Restored from a release checkpoint
    pub release: bool,
    /// Shard that was loaded; `None` on a fresh start
    pub path: Option<PathBuf>,
}

impl ResumePoint {
    /// Start from scratch: no checkpoint was found
    pub fn fresh() -> Self {
        Self {
            iteration: 0,
            epoch: 0,
            release: false,
            path: None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.path.is_none()
    }
}

/// Orchestrates checkpoint save and load for one rank
pub struct CheckpointCoordinator {
    config: CheckpointConfig,
    coords: ShardCoords,
    role: WriterRole,
    collective: Arc<dyn Collective>,
    session: CheckpointSession,
}

impl CheckpointCoordinator {
    pub fn new(
        config: CheckpointConfig,
        topology: &dyn RankTopology,
        collective: Arc<dyn Collective>,
    ) -> Self {
        Self {
            config,
            coords: topology.shard_coords(),
            role: WriterRole::resolve(topology),
            collective,
            session: CheckpointSession::new(),
        }
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    pub fn role(&self) -> WriterRole {
        self.role
    }

    pub fn session(&self) -> &CheckpointSession {
        &self.session
    }

    /// Save the training state at `iteration`.
    ///
    /// All ranks must call this together. Shard writers persist their blob,
    /// then every rank waits at a barrier before rank 0 advertises the new
    /// iteration in the tracker, and again after.
    pub async fn save(
        &self,
        iteration: Iteration,
        epoch: Epoch,
        state: &TrainingState<'_>,
        run_args: &TrainingArgs,
    ) -> Result<SaveReport> {
        let root = self.config.checkpoint_root();
        if self.role.is_global_primary() {
            info!(iteration, root = %root.display(), "Saving checkpoint");
        }

        let mut report = SaveReport {
            iteration,
            path: None,
            size_bytes: 0,
        };

        if self.role.is_primary_writer() {
            let start = Instant::now();
            let blob = self.assemble(iteration, epoch, state, run_args)?;
            let identity = CheckpointIdentity::new(CheckpointTag::Iteration(iteration), self.coords);

            let size_bytes = LocalStorage::new(&root)
                .write(&identity.relative_path(), format::encode(&blob)?)
                .await?;

            let path = identity.path(&root);
            debug!(
                rank = self.role.rank(),
                path = %path.display(),
                size_bytes,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Checkpoint shard written"
            );
            report.path = Some(path);
            report.size_bytes = size_bytes;
        }

        // No rank may advertise the checkpoint before every shard is on disk
        self.collective.barrier().await?;

        if self.role.is_global_primary() {
            info!(iteration, root = %root.display(), "Successfully saved checkpoint");
            Tracker::new(&root).write(iteration).await?;
        }

        self.collective.barrier().await?;
        Ok(report)
    }

    fn assemble(
        &self,
        iteration: Iteration,
        epoch: Epoch,
        state: &TrainingState<'_>,
        run_args: &TrainingArgs,
    ) -> Result<CheckpointState> {
        require_models(state)?;

        let mut blob = CheckpointState::new();
        blob.insert(keys::ARGS, args::snapshot(run_args)?);
        blob.insert(keys::CHECKPOINT_VERSION, u64::from(CheckpointVersion::CURRENT.0));
        blob.insert(keys::ITERATION, iteration);
        blob.insert(keys::EPOCH, epoch);

        let count = state.models.len();
        for (index, model) in state.models.iter().enumerate() {
            blob.insert(keys::model_key(index, count), unwrap_model(&**model).state_dict()?);
        }

        if !self.config.no_save_optim {
            if let Some(optimizer) = &state.optimizer {
                blob.insert(keys::OPTIMIZER, optimizer.state_dict()?);
            }
            if let Some(lr_scheduler) = &state.lr_scheduler {
                blob.insert(keys::LR_SCHEDULER, lr_scheduler.state_dict()?);
            }
        }

        if !self.config.no_save_rng {
            state.rng.rng_states()?.insert_into(&mut blob);
        }

        Ok(blob)
    }

    /// Restore the training state from the latest checkpoint.
    ///
    /// Returns [`ResumePoint::fresh`] when the resume root has no tracker.
    /// Every other problem is an error the caller should treat as fatal.
    pub async fn load(
        &self,
        state: &mut TrainingState<'_>,
        run_args: &mut TrainingArgs,
    ) -> Result<ResumePoint> {
        require_models(state)?;

        let root = self.config.resume_root();
        let tracker = Tracker::new(&root);

        let record = match tracker.read().await? {
            Some(record) => record,
            None => {
                if self.role.is_global_primary() {
                    warn!(
                        path = %tracker.path().display(),
                        "Could not find the tracker file, will not load any checkpoint and will start from random"
                    );
                }
                return Ok(ResumePoint::fresh());
            }
        };

        let reconciled = tracker::reconcile(self.collective.as_ref(), record).await?;
        let tag = CheckpointTag::new(reconciled.iteration, reconciled.release);
        let identity = CheckpointIdentity::new(tag, self.coords);
        let path = identity.path(&root);
        let path_str = path.display().to_string();

        if self.role.is_global_primary() {
            info!(root = %root.display(), checkpoint = %tag, "Loading checkpoint");
        }

        let data = LocalStorage::new(&root)
            .read(&identity.relative_path())
            .await
            .map_err(|e| Error::CheckpointCorrupted {
                path: path_str.clone(),
                reason: e.to_string(),
            })?;
        let blob = format::decode(&data, &path_str)?;

        let version = checkpoint_version(&blob, &path_str)?;
        self.session.set_checkpoint_version(version)?;

        let epoch = blob
            .get(keys::EPOCH)
            .and_then(StateValue::as_u64)
            .ok_or_else(|| Error::MalformedCheckpoint {
                path: path_str.clone(),
                field: keys::EPOCH.to_string(),
            })?;

        let reset_progress = self.config.finetune || reconciled.release;
        let iteration = if reset_progress {
            0
        } else {
            blob.first_present(keys::ITERATION_FIELDS)
                .and_then(|(_, value)| value.as_u64())
                .ok_or_else(|| Error::MalformedCheckpoint {
                    path: path_str.clone(),
                    field: keys::ITERATION_FIELDS.join(" | "),
                })?
        };

        match blob.get(keys::ARGS) {
            Some(snapshot) => {
                args::check_checkpoint_args(snapshot, run_args, version, &path_str)?;
                args::restore_consumed_samples(snapshot, run_args);
            }
            None => {
                if self.role.is_global_primary() {
                    warn!(path = %path_str, "Could not find arguments in the checkpoint");
                }
            }
        }

        let count = state.models.len();
        for (index, model) in state.models.iter_mut().enumerate() {
            let key = keys::model_key(index, count);
            let sub_state = require(&blob, &key, "model", &path_str, MODEL_HINT)?;
            load_unwrapped(&mut **model, sub_state, self.config.strict_load)?;
        }

        if self.role.is_global_primary() {
            info!(version = %version, "Checkpoint version");
        }

        if !(reset_progress || self.config.no_load_optim) {
            if let Some(optimizer) = state.optimizer.as_mut() {
                let sub_state = require(&blob, keys::OPTIMIZER, "optimizer", &path_str, OPTIMIZER_HINT)?;
                optimizer.load_state_dict(sub_state, true)?;
            }
            if let Some(lr_scheduler) = state.lr_scheduler.as_mut() {
                let sub_state =
                    require(&blob, keys::LR_SCHEDULER, "optimizer", &path_str, OPTIMIZER_HINT)?;
                lr_scheduler.load_state_dict(sub_state, true)?;
            }
        }

        if !(reset_progress || self.config.no_load_rng) {
            let bundle = RngBundle::extract(&blob).map_err(|field| Error::MissingState {
                state: "rng".to_string(),
                path: path_str.clone(),
                field: field.to_string(),
                hint: RNG_HINT.to_string(),
            })?;
            state.rng.set_rng_states(&bundle)?;
        }

        // Nobody starts training until every rank has restored
        self.collective.barrier().await?;

        if self.role.is_global_primary() {
            info!(root = %root.display(), iteration, epoch, "Successfully loaded checkpoint");
        }

        Ok(ResumePoint {
            iteration,
            epoch,
            release: reconciled.release,
            path: Some(path),
        })
    }
}

fn require_models(state: &TrainingState<'_>) -> Result<()> {
    if state.models.is_empty() {
        return Err(Error::InvalidConfig {
            message: "no model registered for checkpointing".to_string(),
        });
    }
    Ok(())
}

/// Version tag of a blob; untagged blobs are legacy
fn checkpoint_version(blob: &CheckpointState, path: &str) -> Result<CheckpointVersion> {
    match blob.get(keys::CHECKPOINT_VERSION) {
        None => Ok(CheckpointVersion::LEGACY),
        Some(value) => value
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .map(CheckpointVersion)
            .ok_or_else(|| Error::CheckpointCorrupted {
                path: path.to_string(),
                reason: format!("unreadable {} {:?}", keys::CHECKPOINT_VERSION, value),
            }),
    }
}

fn require<'b>(
    blob: &'b CheckpointState,
    key: &str,
    state: &str,
    path: &str,
    hint: &str,
) -> Result<&'b StateValue> {
    blob.get(key).ok_or_else(|| Error::MissingState {
        state: state.to_string(),
        path: path.to_string(),
        field: key.to_string(),
        hint: hint.to_string(),
    })
}
