//! Offline inspection of a checkpoint root

use runtime_core::{Result, ShardCoords};
use serde::Serialize;
use std::path::Path;
use storage::{LocalStorage, StorageBackend};

use crate::format;
use crate::namer::{CheckpointIdentity, CheckpointTag, CHECKPOINT_EXTENSION};
use crate::tracker::{Tracker, TrackerRecord};

/// One shard file of a checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardEntry {
    /// Path relative to the checkpoint root
    pub path: String,
    pub size_bytes: u64,
}

/// Every shard file of the checkpoint `tag`, sorted by path
pub async fn list_shards(root: &Path, tag: CheckpointTag) -> Result<Vec<ShardEntry>> {
    let storage = LocalStorage::new(root);
    let suffix = format!(".{}", CHECKPOINT_EXTENSION);

    let mut shards = Vec::new();
    for path in storage.list(&format!("{}/", tag.directory())).await? {
        if !path.ends_with(&suffix) {
            continue;
        }
        let size_bytes = tokio::fs::metadata(storage.resolve_path(&path)).await?.len();
        shards.push(ShardEntry { path, size_bytes });
    }
    Ok(shards)
}

/// Summarize the latest checkpoint under `root` as seen by the shard at `coords`.
///
/// Returns `None` when the root has no tracker.
pub async fn summarize(root: &Path, coords: ShardCoords) -> Result<Option<serde_json::Value>> {
    let record = match Tracker::new(root).read().await? {
        Some(record) => record,
        None => return Ok(None),
    };

    let tag = CheckpointTag::new(record.iteration(), record.is_release());
    let identity = CheckpointIdentity::new(tag, coords);
    let data = LocalStorage::new(root).read(&identity.relative_path()).await?;
    let blob = format::decode(&data, &identity.path(root).display().to_string())?;
    let shards = list_shards(root, tag).await?;

    Ok(Some(serde_json::json!({
        "tracker": record.to_string(),
        "release": matches!(record, TrackerRecord::Release),
        "shard": identity.relative_path(),
        "size_bytes": data.len(),
        "fields": blob.to_json_summary(),
        "shards": shards,
    })))
}
