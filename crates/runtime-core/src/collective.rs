//! Collective operations used to keep ranks in lock-step around checkpoint I/O
//!
//! Every rank must issue the same collectives in the same order. A rank that
//! skips one leaves its peers waiting forever in a real process group;
//! [`LocalGroup`] turns that into a detectable error for tests and
//! single-host simulation.

use crate::{CheckpointConfig, Error, Rank, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Cross-rank synchronization primitives
#[async_trait]
pub trait Collective: Send + Sync {
    /// Rank of the calling process within the group
    fn rank(&self) -> Rank;

    /// Number of participating ranks
    fn world_size(&self) -> usize;

    /// Block until every rank has arrived
    async fn barrier(&self) -> Result<()>;

    /// Contribute `value`; every rank receives the maximum over all ranks
    async fn all_reduce_max(&self, value: u64) -> Result<u64>;
}

/// Collective for a job running as a single process
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

#[async_trait]
impl Collective for SingleProcess {
    fn rank(&self) -> Rank {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    async fn barrier(&self) -> Result<()> {
        Ok(())
    }

    async fn all_reduce_max(&self, value: u64) -> Result<u64> {
        Ok(value)
    }
}

/// Kind of collective call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectiveOp {
    Barrier,
    ReduceMax,
}

impl fmt::Display for CollectiveOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectiveOp::Barrier => write!(f, "barrier"),
            CollectiveOp::ReduceMax => write!(f, "all_reduce_max"),
        }
    }
}

/// One in-flight collective, keyed by its per-rank sequence number
struct Round {
    op: CollectiveOp,
    arrived: usize,
    max: u64,
    waiters: Vec<oneshot::Sender<u64>>,
}

struct GroupShared {
    world_size: usize,
    timeout: Duration,
    rounds: DashMap<u64, Arc<Mutex<Round>>>,
}

/// Factory for an in-process collective group
pub struct LocalGroup;

impl LocalGroup {
    /// Create handles for `world_size` ranks sharing one group.
    ///
    /// Handle `i` acts as rank `i`. Any wait longer than `timeout` fails with
    /// [`Error::BarrierTimeout`].
    pub fn new(world_size: usize, timeout: Duration) -> Vec<LocalGroupMember> {
        let shared = Arc::new(GroupShared {
            world_size,
            timeout,
            rounds: DashMap::new(),
        });

        (0..world_size)
            .map(|rank| LocalGroupMember {
                rank,
                shared: Arc::clone(&shared),
                next_sequence: AtomicU64::new(0),
                history: Mutex::new(Vec::new()),
            })
            .collect()
    }

    /// Create handles whose waits are bounded by the configured barrier timeout
    pub fn from_config(world_size: usize, config: &CheckpointConfig) -> Vec<LocalGroupMember> {
        Self::new(world_size, config.barrier_timeout)
    }
}

/// One rank's handle on a [`LocalGroup`]
pub struct LocalGroupMember {
    rank: Rank,
    shared: Arc<GroupShared>,
    next_sequence: AtomicU64,
    history: Mutex<Vec<CollectiveOp>>,
}

impl LocalGroupMember {
    /// Collectives this rank has issued, in order
    pub fn history(&self) -> Vec<CollectiveOp> {
        self.history.lock().clone()
    }

    /// Number of collectives this rank has issued
    pub fn call_count(&self) -> u64 {
        self.next_sequence.load(Ordering::SeqCst)
    }

    async fn run(&self, op: CollectiveOp, value: u64) -> Result<u64> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        self.history.lock().push(op);

        // Clone the round out so the map shard lock is not held while waiting
        let round = {
            let entry = self.shared.rounds.entry(sequence).or_insert_with(|| {
                Arc::new(Mutex::new(Round {
                    op,
                    arrived: 0,
                    max: 0,
                    waiters: Vec::new(),
                }))
            });
            Arc::clone(entry.value())
        };

        let rx = {
            let mut round = round.lock();
            if round.op != op {
                return Err(Error::CollectiveMismatch {
                    sequence,
                    rank: self.rank,
                    expected: round.op.to_string(),
                    actual: op.to_string(),
                });
            }

            round.arrived += 1;
            round.max = round.max.max(value);

            debug!(
                rank = self.rank,
                sequence,
                op = %op,
                arrived = round.arrived,
                expected = self.shared.world_size,
                "Rank arrived at collective"
            );

            if round.arrived >= self.shared.world_size {
                // Last rank to arrive releases everyone
                let max = round.max;
                for waiter in round.waiters.drain(..) {
                    let _ = waiter.send(max);
                }
                drop(round);
                self.shared.rounds.remove(&sequence);
                return Ok(max);
            }

            let (tx, rx) = oneshot::channel();
            round.waiters.push(tx);
            rx
        };

        match tokio::time::timeout(self.shared.timeout, rx).await {
            Ok(Ok(max)) => Ok(max),
            Ok(Err(_)) => Err(Error::Internal {
                message: format!("collective #{} released without a result", sequence),
            }),
            Err(_) => Err(Error::BarrierTimeout {
                operation: op.to_string(),
                sequence,
                rank: self.rank,
                timeout_ms: self.shared.timeout.as_millis() as u64,
            }),
        }
    }
}

#[async_trait]
impl Collective for LocalGroupMember {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    async fn barrier(&self) -> Result<()> {
        self.run(CollectiveOp::Barrier, 0).await.map(|_| ())
    }

    async fn all_reduce_max(&self, value: u64) -> Result<u64> {
        self.run(CollectiveOp::ReduceMax, value).await
    }
}
