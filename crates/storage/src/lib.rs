//! Storage - Filesystem backend for checkpoint blobs and tracker files
//!
//! Writes are atomic: data lands in a uniquely named temp file that is
//! synced and then renamed over the destination, so readers never observe
//! a partially written checkpoint or tracker.
//!
//! # Example
//!
//! ```no_run
//! use storage::{StorageBackend, LocalStorage};
//! use bytes::Bytes;
//!
//! # async fn example() -> runtime_core::Result<()> {
//! let storage = LocalStorage::new("/tmp/run/ckpt");
//! storage.write("iter_0000100/mp_rank_00/model_optim_rng.ckpt", Bytes::from(vec![1, 2, 3])).await?;
//! let data = storage.read("iter_0000100/mp_rank_00/model_optim_rng.ckpt").await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod local;

pub use backend::StorageBackend;
pub use local::LocalStorage;
