//! Local filesystem storage backend
//!
//! Atomic writes go through a sibling temp file, `sync_all`, rename, and a
//! sync of the parent directory so the rename itself survives a crash.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::{Error, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::StorageBackend;

/// Local filesystem storage rooted at a checkpoint directory
#[derive(Debug, Clone)]
pub struct LocalStorage {
    /// Base path for all storage operations
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a relative path to a path under the root
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }

    /// Unique temp file next to the destination, hidden from listings
    fn temp_path(full_path: &Path) -> PathBuf {
        let temp_name = format!(
            ".{}.{}.tmp",
            full_path.file_name().unwrap_or_default().to_string_lossy(),
            Uuid::new_v4()
        );
        full_path.with_file_name(temp_name)
    }

    async fn write_synced(temp_path: &Path, data: &[u8]) -> std::io::Result<()> {
        let mut file = fs::File::create(temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await
    }
}

/// Flush directory metadata so a completed rename is durable
#[cfg(unix)]
async fn sync_dir(path: &Path) -> std::io::Result<()> {
    fs::File::open(path).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl StorageBackend for LocalStorage {
    #[instrument(skip(self), fields(backend = "local"))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        let full_path = self.resolve_path(path);
        debug!(?full_path, "Reading file");

        match fs::read(&full_path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::StoragePathNotFound {
                path: full_path.display().to_string(),
            }),
            Err(e) => Err(Error::Storage {
                message: format!("Failed to read {}: {}", full_path.display(), e),
            }),
        }
    }

    #[instrument(skip(self, data), fields(backend = "local", size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let full_path = self.resolve_path(path);
        let temp_path = Self::temp_path(&full_path);
        let size = data.len() as u64;

        let parent = full_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.base_path.clone());
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| Error::Storage {
                message: format!("Failed to create directory {}: {}", parent.display(), e),
            })?;

        if let Err(e) = Self::write_synced(&temp_path, &data).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Error::Storage {
                message: format!("Failed to write {}: {}", temp_path.display(), e),
            });
        }

        if let Err(e) = fs::rename(&temp_path, &full_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Error::Storage {
                message: format!(
                    "Failed to rename {} to {}: {}",
                    temp_path.display(),
                    full_path.display(),
                    e
                ),
            });
        }

        sync_dir(&parent).await.map_err(|e| Error::Storage {
            message: format!("Failed to sync directory {}: {}", parent.display(), e),
        })?;

        debug!(?full_path, size, "File written atomically");
        Ok(size)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.resolve_path(path);
        match fs::metadata(&full_path).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Storage {
                message: format!("Failed to stat {}: {}", full_path.display(), e),
            }),
        }
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut results = Vec::new();
        let mut stack = vec![self.base_path.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::Storage {
                        message: format!("Failed to list {}: {}", dir.display(), e),
                    })
                }
            };

            while let Some(entry) = entries.next_entry().await? {
                let entry_path = entry.path();
                let file_type = entry.file_type().await?;

                if file_type.is_dir() {
                    stack.push(entry_path);
                    continue;
                }
                if !file_type.is_file() || entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }

                if let Ok(relative) = entry_path.strip_prefix(&self.base_path) {
                    let relative = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if relative.starts_with(prefix) {
                        results.push(relative);
                    }
                }
            }
        }

        results.sort();
        debug!(count = results.len(), prefix, "Listed files");
        Ok(results)
    }
}
