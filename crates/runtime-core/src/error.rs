//! Error types for training checkpoint coordination

use thiserror::Error;

/// Result type alias using the runtime Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for checkpoint save/restore and rank coordination
#[derive(Error, Debug)]
pub enum Error {
    // Tracker errors
    #[error("Invalid tracker file {path}: expected an iteration number or \"release\", found {content:?}")]
    MalformedTracker { path: String, content: String },

    // Checkpoint errors
    #[error("Could not load checkpoint {path}: {reason}")]
    CheckpointCorrupted { path: String, reason: String },

    #[error("Malformed checkpoint {path}: missing required field `{field}`")]
    MalformedCheckpoint { path: String, field: String },

    #[error("Unable to load {state} state from checkpoint {path} (missing `{field}`). {hint}")]
    MissingState {
        state: String,
        path: String,
        field: String,
        hint: String,
    },

    #[error("{field} value from checkpoint ({checkpoint_value}) is not equal to the input argument value ({current_value})")]
    ConfigMismatch {
        field: String,
        checkpoint_value: String,
        current_value: String,
    },

    #[error("Checkpoint versions do not match: session already loaded version {current}, found {found}")]
    VersionConflict { current: u32, found: u32 },

    #[error("State dict error: {message}")]
    StateDict { message: String },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    // Coordination errors
    #[error("Collective timeout: {operation} #{sequence} on rank {rank} (waited {timeout_ms}ms)")]
    BarrierTimeout {
        operation: String,
        sequence: u64,
        rank: usize,
        timeout_ms: u64,
    },

    #[error("Collective call order diverged at #{sequence}: rank {rank} issued {actual}, group expected {expected}")]
    CollectiveMismatch {
        sequence: u64,
        rank: usize,
        expected: String,
        actual: String,
    },

    #[error("Invalid topology: {message}")]
    InvalidTopology { message: String },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Returns true if the process should stop rather than continue training.
    ///
    /// Every error surfaced by save/load is fatal for the rank: recoverable
    /// conditions (missing tracker, rank disagreement) never become errors.
    /// Only a lost wait on a collective is reported as non-fatal, since the
    /// caller may still want to tear the group down cleanly.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::BarrierTimeout { .. })
    }

    /// Returns true if this error indicates an internal consistency bug
    /// rather than a user or environment problem
    pub fn is_consistency_violation(&self) -> bool {
        matches!(
            self,
            Error::VersionConflict { .. }
                | Error::CollectiveMismatch { .. }
                | Error::Internal { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
