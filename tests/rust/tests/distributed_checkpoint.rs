//! Multi-rank checkpoint save and resume
//!
//! Every rank runs in its own task against an in-process collective group:
//! - Shard writers and data-parallel replicas
//! - Tracker divergence across ranks and max reconciliation
//! - Identical collective sequences on every rank
//! - Pipeline-parallel shard naming

use anyhow::Result;
use checkpoint::{
    CheckpointCoordinator, RngBundle, RngStateProvider, StateProvider, StateValue, Tensor,
    Tracker, TrackerRecord, TrainingState,
};
use runtime_core::{
    CheckpointConfig, Collective, CollectiveOp, Error, LocalGroup, LocalGroupMember,
    StaticTopology, TrainingArgs,
};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tracing_subscriber::fmt::MakeWriter;

/// Collects formatted log lines so tests can check who warned
#[derive(Clone, Default)]
struct LogBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl LogBuffer {
    /// Route warnings on this thread into the buffer until the guard drops
    fn capture(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    fn lines_containing(&self, needle: &str) -> Vec<String> {
        let data = self.inner.lock().expect("log buffer poisoned");
        String::from_utf8_lossy(&data)
            .lines()
            .filter(|line| line.contains(needle))
            .map(str::to_string)
            .collect()
    }
}

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner
            .lock()
            .expect("log buffer poisoned")
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Parameters of one rank's model shard
#[derive(Debug, Clone, PartialEq)]
struct ShardModule {
    params: BTreeMap<String, StateValue>,
}

impl ShardModule {
    fn for_rank(rank: usize, step: u64) -> Self {
        let base = rank as f32 + step as f32 / 1000.0;
        let mut params = BTreeMap::new();
        params.insert(
            "attention.dense.weight".to_string(),
            StateValue::Tensor(
                Tensor::from_f32(vec![2, 3], (0..6).map(|i| base + i as f32 * 0.1).collect())
                    .expect("valid tensor"),
            ),
        );
        params.insert("step".to_string(), StateValue::UInt(step));
        Self { params }
    }

    fn empty() -> Self {
        let mut params = BTreeMap::new();
        params.insert("attention.dense.weight".to_string(), StateValue::Null);
        params.insert("step".to_string(), StateValue::Null);
        Self { params }
    }
}

impl StateProvider for ShardModule {
    fn state_dict(&self) -> runtime_core::Result<StateValue> {
        Ok(StateValue::Map(self.params.clone()))
    }

    fn load_state_dict(&mut self, state: &StateValue, _strict: bool) -> runtime_core::Result<()> {
        let map = state.as_map().ok_or_else(|| Error::StateDict {
            message: "expected a map".to_string(),
        })?;
        self.params = map.clone();
        Ok(())
    }
}

/// Data-parallel wrapper around the real module
struct DataParallel {
    module: ShardModule,
}

impl StateProvider for DataParallel {
    fn state_dict(&self) -> runtime_core::Result<StateValue> {
        let mut map = BTreeMap::new();
        map.insert("module".to_string(), self.module.state_dict()?);
        Ok(StateValue::Map(map))
    }

    fn load_state_dict(&mut self, state: &StateValue, strict: bool) -> runtime_core::Result<()> {
        self.module.load_state_dict(state, strict)
    }

    fn inner(&self) -> Option<&dyn StateProvider> {
        Some(&self.module)
    }

    fn inner_mut(&mut self) -> Option<&mut dyn StateProvider> {
        Some(&mut self.module)
    }
}

struct RankRng {
    bundle: RngBundle,
}

impl RankRng {
    fn for_rank(rank: usize) -> Self {
        let seed = 1234 + rank as u64;
        let mut tracker_states = BTreeMap::new();
        tracker_states.insert("model-parallel-rng".to_string(), StateValue::UInt(seed * 7));
        Self {
            bundle: RngBundle {
                random: StateValue::UInt(seed),
                numeric: StateValue::UInt(seed + 1),
                host: StateValue::UInt(seed + 2),
                device: StateValue::UInt(seed + 3),
                tracker_states,
            },
        }
    }
}

impl RngStateProvider for RankRng {
    fn rng_states(&self) -> runtime_core::Result<RngBundle> {
        Ok(self.bundle.clone())
    }

    fn set_rng_states(&mut self, bundle: &RngBundle) -> runtime_core::Result<()> {
        self.bundle = bundle.clone();
        Ok(())
    }
}

struct RankOutcome {
    rank: usize,
    save_path: Option<PathBuf>,
    resumed_iteration: u64,
    resumed_epoch: u64,
    restored: ShardModule,
    expected: ShardModule,
    rng_restored: bool,
}

fn group(world_size: usize, config: &CheckpointConfig) -> Vec<Arc<LocalGroupMember>> {
    LocalGroup::from_config(world_size, config)
        .into_iter()
        .map(Arc::new)
        .collect()
}

fn config(save_dir: &Path, load_dir: Option<PathBuf>) -> CheckpointConfig {
    CheckpointConfig {
        save_dir: save_dir.to_path_buf(),
        load_dir,
        barrier_timeout: Duration::from_secs(10),
        ..CheckpointConfig::default()
    }
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

/// Save at `iteration` on every rank, then resume each rank from the
/// directory `load_dirs` assigns to it
async fn save_then_resume(
    save_dir: &Path,
    tp: usize,
    pp: usize,
    dp: usize,
    iteration: u64,
    prepare: impl FnOnce(&Path),
    load_dirs: impl Fn(usize) -> Option<PathBuf>,
) -> Result<(Vec<RankOutcome>, Vec<Arc<LocalGroupMember>>)> {
    let world_size = tp * pp * dp;
    let members = group(world_size, &config(save_dir, None));
    let args = TrainingArgs {
        tensor_model_parallel_size: tp as u64,
        pipeline_model_parallel_size: pp as u64,
        consumed_train_samples: iteration * 32,
        ..TrainingArgs::default()
    };

    // Save phase
    let mut handles = Vec::new();
    for (rank, member) in members.iter().enumerate() {
        let collective: Arc<dyn Collective> = member.clone();
        let topology = StaticTopology::from_global_rank(rank, tp, pp, dp)?;
        let coordinator = CheckpointCoordinator::new(config(save_dir, None), &topology, collective);
        let args = args.clone();
        handles.push(tokio::spawn(async move {
            // Replicas of one shard hold identical weights
            let shard = topology_shard(rank, tp, dp);
            let mut model = DataParallel {
                module: ShardModule::for_rank(shard, iteration),
            };
            let mut optimizer = ShardModule::for_rank(shard + 100, iteration);
            let mut rng = RankRng::for_rank(rank);
            let state = TrainingState::new(&mut rng)
                .model(&mut model)
                .optimizer(&mut optimizer);
            coordinator.save(iteration, 4, &state, &args).await
        }));
    }
    let mut save_paths = Vec::new();
    for handle in handles {
        save_paths.push(handle.await??.path);
    }

    prepare(&save_dir.join("ckpt"));

    // Resume phase on a fresh group
    let resume_members = group(world_size, &config(save_dir, None));
    let mut handles = Vec::new();
    for (rank, member) in resume_members.iter().enumerate() {
        let collective: Arc<dyn Collective> = member.clone();
        let topology = StaticTopology::from_global_rank(rank, tp, pp, dp)?;
        let coordinator =
            CheckpointCoordinator::new(config(save_dir, load_dirs(rank)), &topology, collective);
        let save_path = save_paths[rank].clone();
        handles.push(tokio::spawn(async move {
            let shard = topology_shard(rank, tp, dp);
            let mut model = DataParallel {
                module: ShardModule::empty(),
            };
            let mut optimizer = ShardModule::empty();
            let mut rng = RankRng::for_rank(world_size + rank);
            let mut run_args = TrainingArgs {
                tensor_model_parallel_size: tp as u64,
                pipeline_model_parallel_size: pp as u64,
                ..TrainingArgs::default()
            };
            let mut state = TrainingState::new(&mut rng)
                .model(&mut model)
                .optimizer(&mut optimizer);
            let resume = coordinator.load(&mut state, &mut run_args).await?;
            drop(state);

            assert_eq!(run_args.consumed_train_samples, iteration * 32);
            Ok::<_, Error>(RankOutcome {
                rank,
                save_path,
                resumed_iteration: resume.iteration,
                resumed_epoch: resume.epoch,
                restored: model.module,
                expected: ShardModule::for_rank(shard, iteration),
                rng_restored: rng.bundle == RankRng::for_rank(shard_writer(rank, tp, dp)).bundle,
            })
        }));
    }
    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await??);
    }

    let mut all_members = members;
    all_members.extend(resume_members);
    Ok((outcomes, all_members))
}

/// Model shard index (tensor + pipeline coordinates) of a global rank
fn topology_shard(rank: usize, tp: usize, dp: usize) -> usize {
    let tensor_rank = rank % tp;
    let pipeline_rank = rank / (tp * dp);
    pipeline_rank * tp + tensor_rank
}

/// Global rank that wrote the shard `rank` restores from
fn shard_writer(rank: usize, tp: usize, dp: usize) -> usize {
    let tensor_rank = rank % tp;
    let pipeline_rank = rank / (tp * dp);
    tensor_rank + tp * dp * pipeline_rank
}

#[tokio::test]
async fn test_save_and_resume_with_replicas() -> Result<()> {
    let dir = TempDir::new()?;
    let (outcomes, members) =
        save_then_resume(dir.path(), 2, 1, 2, 100, |_| {}, |_| None).await?;

    // Only data-parallel rank 0 of each tensor shard writes
    let writers: Vec<usize> = outcomes
        .iter()
        .filter(|o| o.save_path.is_some())
        .map(|o| o.rank)
        .collect();
    assert_eq!(writers, vec![0, 1]);
    assert_eq!(
        outcomes[1].save_path,
        Some(dir.path().join("ckpt/iter_0000100/mp_rank_01/model_optim_rng.ckpt"))
    );

    let tracker = Tracker::new(dir.path().join("ckpt"));
    assert_eq!(tracker.read().await?, Some(TrackerRecord::Iteration(100)));
    assert_eq!(std::fs::read_to_string(tracker.path())?.trim(), "100");

    for outcome in &outcomes {
        assert_eq!(outcome.resumed_iteration, 100);
        assert_eq!(outcome.resumed_epoch, 4);
        assert_eq!(outcome.restored, outcome.expected, "rank {}", outcome.rank);
        // Replicas restore the RNG state their shard writer saved
        assert!(outcome.rng_restored, "rank {}", outcome.rank);
    }

    let histories: Vec<Vec<CollectiveOp>> = members.iter().map(|m| m.history()).collect();
    assert_eq!(histories[0], vec![CollectiveOp::Barrier, CollectiveOp::Barrier]);
    assert!(histories[..4].iter().all(|h| h == &histories[0]));
    assert!(histories[4..].iter().all(|h| h == &histories[4]));
    assert_eq!(histories[4], vec![CollectiveOp::ReduceMax, CollectiveOp::Barrier]);
    Ok(())
}

#[tokio::test]
async fn test_stale_tracker_is_reconciled_to_maximum() -> Result<()> {
    let dir = TempDir::new()?;
    let stale_root = dir.path().join("stale");
    let logs = LogBuffer::default();
    let _guard = logs.capture();

    let stale = stale_root.clone();
    let (outcomes, _) = save_then_resume(
        dir.path(),
        2,
        1,
        1,
        100,
        |root| {
            copy_dir(root, &stale).expect("copy checkpoint root");
            std::fs::write(stale.join("latest_checkpointed_iteration.txt"), "97")
                .expect("write stale tracker");
        },
        |rank| (rank == 1).then(|| stale_root.clone()),
    )
    .await?;

    for outcome in &outcomes {
        assert_eq!(outcome.resumed_iteration, 100, "rank {}", outcome.rank);
        assert_eq!(outcome.resumed_epoch, 4);
        assert_eq!(outcome.restored, outcome.expected);
    }

    // The stale rank alone warns about its divergent tracker
    let divergence = logs.lines_containing("Tracker iteration differs");
    assert_eq!(divergence.len(), 1);
    assert!(divergence[0].contains("rank=1"));
    assert!(divergence[0].contains("local_iteration=97"));
    Ok(())
}

#[tokio::test]
async fn test_pipeline_shards_are_named_per_stage() -> Result<()> {
    let dir = TempDir::new()?;
    let (outcomes, _) = save_then_resume(dir.path(), 1, 2, 1, 7, |_| {}, |_| None).await?;

    let paths: Vec<PathBuf> = outcomes.iter().filter_map(|o| o.save_path.clone()).collect();
    assert_eq!(
        paths,
        vec![
            dir.path().join("ckpt/iter_0000007/mp_rank_00_pp_rank_000/model_optim_rng.ckpt"),
            dir.path().join("ckpt/iter_0000007/mp_rank_00_pp_rank_001/model_optim_rng.ckpt"),
        ]
    );
    assert!(outcomes.iter().all(|o| o.restored == o.expected));

    let shards =
        checkpoint::list_shards(&dir.path().join("ckpt"), checkpoint::CheckpointTag::Iteration(7))
            .await?;
    assert_eq!(shards.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_missing_rank_times_out_before_tracker_update() -> Result<()> {
    let dir = TempDir::new()?;
    let config = CheckpointConfig {
        barrier_timeout: Duration::from_millis(200),
        ..config(dir.path(), None)
    };
    let members = group(2, &config);

    let collective: Arc<dyn Collective> = members[0].clone();
    let topology = StaticTopology::from_global_rank(0, 2, 1, 1)?;
    let coordinator = CheckpointCoordinator::new(config, &topology, collective);

    let mut model = ShardModule::for_rank(0, 5);
    let mut rng = RankRng::for_rank(0);
    let state = TrainingState::new(&mut rng).model(&mut model);
    let err = coordinator
        .save(5, 0, &state, &TrainingArgs {
            tensor_model_parallel_size: 2,
            ..TrainingArgs::default()
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::BarrierTimeout { timeout_ms: 200, .. }));
    assert!(!err.is_fatal());
    // The shard is on disk but never advertised
    assert!(dir
        .path()
        .join("ckpt/iter_0000005/mp_rank_00/model_optim_rng.ckpt")
        .exists());
    assert_eq!(Tracker::new(dir.path().join("ckpt")).read().await?, None);
    Ok(())
}

#[tokio::test]
async fn test_fresh_start_issues_no_collectives() -> Result<()> {
    let dir = TempDir::new()?;
    let logs = LogBuffer::default();
    let _guard = logs.capture();
    let members = group(2, &config(dir.path(), None));

    let mut handles = Vec::new();
    for (rank, member) in members.iter().enumerate() {
        let collective: Arc<dyn Collective> = member.clone();
        let topology = StaticTopology::from_global_rank(rank, 2, 1, 1)?;
        let coordinator = CheckpointCoordinator::new(config(dir.path(), None), &topology, collective);
        handles.push(tokio::spawn(async move {
            let mut model = ShardModule::empty();
            let mut rng = RankRng::for_rank(rank);
            let mut state = TrainingState::new(&mut rng).model(&mut model);
            coordinator
                .load(&mut state, &mut TrainingArgs::default())
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await??.is_fresh());
    }
    assert!(members.iter().all(|m| m.call_count() == 0));
    // Only global rank 0 reports the missing tracker
    assert_eq!(logs.lines_containing("Could not find the tracker file").len(), 1);
    Ok(())
}
