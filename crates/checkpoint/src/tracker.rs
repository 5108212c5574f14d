//! Tracker file recording the latest complete checkpoint
//!
//! The tracker is a single line: an iteration number or the literal
//! `release`. Global rank 0 rewrites it only after every shard writer has
//! passed the post-write barrier, so it never advertises a partial save.

use bytes::Bytes;
use runtime_core::{Collective, Error, Iteration, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use storage::{LocalStorage, StorageBackend};
use tracing::{debug, warn};

/// Tracker file name inside a checkpoint root
pub const TRACKER_FILENAME: &str = "latest_checkpointed_iteration.txt";

/// Tracker content marking a release checkpoint
pub const RELEASE_MARKER: &str = "release";

/// Parsed tracker content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerRecord {
    Iteration(Iteration),
    Release,
}

impl TrackerRecord {
    /// Parse tracker text; surrounding whitespace is ignored
    pub fn parse(content: &str) -> Option<Self> {
        let content = content.trim();
        if content == RELEASE_MARKER {
            return Some(TrackerRecord::Release);
        }
        content.parse::<Iteration>().ok().map(TrackerRecord::Iteration)
    }

    pub fn is_release(&self) -> bool {
        matches!(self, TrackerRecord::Release)
    }

    /// Value contributed to cross-rank reconciliation
    pub fn iteration(&self) -> Iteration {
        match self {
            TrackerRecord::Iteration(iteration) => *iteration,
            TrackerRecord::Release => 0,
        }
    }
}

impl fmt::Display for TrackerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerRecord::Iteration(iteration) => write!(f, "{}", iteration),
            TrackerRecord::Release => write!(f, "{}", RELEASE_MARKER),
        }
    }
}

/// Tracker file of one checkpoint root
#[derive(Debug, Clone)]
pub struct Tracker {
    storage: LocalStorage,
}

impl Tracker {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            storage: LocalStorage::new(root),
        }
    }

    /// Location of the tracker file
    pub fn path(&self) -> PathBuf {
        self.storage.resolve_path(TRACKER_FILENAME)
    }

    /// Record `iteration` as the latest checkpoint
    pub async fn write(&self, iteration: Iteration) -> Result<()> {
        self.write_record(TrackerRecord::Iteration(iteration)).await
    }

    /// Replace the tracker content atomically
    pub async fn write_record(&self, record: TrackerRecord) -> Result<()> {
        self.storage
            .write(TRACKER_FILENAME, Bytes::from(record.to_string()))
            .await?;
        debug!(path = %self.path().display(), record = %record, "Tracker updated");
        Ok(())
    }

    /// Read the tracker; `None` means no checkpoint has been recorded
    pub async fn read(&self) -> Result<Option<TrackerRecord>> {
        if !self.storage.exists(TRACKER_FILENAME).await? {
            return Ok(None);
        }

        let data = match self.storage.read(TRACKER_FILENAME).await {
            Ok(data) => data,
            Err(Error::StoragePathNotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        let content = String::from_utf8_lossy(&data);
        TrackerRecord::parse(&content)
            .map(Some)
            .ok_or_else(|| Error::MalformedTracker {
                path: self.path().display().to_string(),
                content: content.trim().to_string(),
            })
    }
}

/// Outcome of reconciling tracker values across ranks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    /// Iteration every rank adopts
    pub iteration: Iteration,
    /// Whether this rank's tracker named a release checkpoint
    pub release: bool,
    /// What this rank's own tracker said
    pub local_iteration: Iteration,
    /// This rank's tracker disagreed with the group
    pub diverged: bool,
}

/// Agree on one iteration across all ranks by taking the maximum.
///
/// Ranks that crashed mid-save may see different trackers; the highest
/// value any rank can see is assumed to be the most complete checkpoint.
pub async fn reconcile(collective: &dyn Collective, record: TrackerRecord) -> Result<Reconciled> {
    let local_iteration = record.iteration();
    let iteration = collective.all_reduce_max(local_iteration).await?;
    let diverged = iteration != local_iteration;

    if diverged {
        warn!(
            rank = collective.rank(),
            local_iteration,
            max_iteration = iteration,
            "Tracker iteration differs from the maximum across ranks, replacing it with the maximum"
        );
    }

    Ok(Reconciled {
        iteration,
        release: record.is_release(),
        local_iteration,
        diverged,
    })
}
