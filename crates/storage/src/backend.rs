//! Storage backend trait definition

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::Result;

/// Async trait for checkpoint storage
///
/// Paths are relative to the backend's root and use `/` separators.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read the full contents at `path`
    ///
    /// # Errors
    /// Returns `StoragePathNotFound` if the path doesn't exist
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Replace the contents at `path`
    ///
    /// Creates parent directories if they don't exist. The write is atomic:
    /// either the previous contents or the new contents are visible, never
    /// a mix.
    ///
    /// # Returns
    /// Number of bytes written
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Check if a path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// List all file paths under a given prefix, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}
