//! Per-run checkpoint session state

use crate::{CheckpointVersion, Error, Result};
use parking_lot::Mutex;
use tracing::debug;

/// Run-scoped context that remembers the format version of the checkpoint
/// this run restored from.
///
/// The version is write-once: setting it again with the same value is a
/// no-op, setting a different value is a consistency violation.
#[derive(Debug, Default)]
pub struct CheckpointSession {
    version: Mutex<Option<CheckpointVersion>>,
}

impl CheckpointSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the version of a loaded checkpoint
    pub fn set_checkpoint_version(&self, version: CheckpointVersion) -> Result<()> {
        let mut slot = self.version.lock();
        match *slot {
            Some(current) if current != version => Err(Error::VersionConflict {
                current: current.0,
                found: version.0,
            }),
            Some(_) => Ok(()),
            None => {
                debug!(version = %version, "Checkpoint version set");
                *slot = Some(version);
                Ok(())
            }
        }
    }

    /// Version of the checkpoint loaded in this run, if any
    pub fn checkpoint_version(&self) -> Option<CheckpointVersion> {
        *self.version.lock()
    }
}
