//! Error types for the training orchestrator.
//!
//! Everything here is fatal to the job except numeric overflow, which never
//! leaves the gradient synchronizer as an error: it is absorbed as a skipped
//! step plus a loss-scale change.

use std::path::Path;

use thiserror::Error;

/// Main error type for orchestration
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum JobError {
    /// Invalid or contradictory job parameters
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A checkpoint record could not be read or is missing required fields
    #[error("Corrupt checkpoint at '{path}': {message}")]
    CheckpointCorrupt { message: String, path: String },

    /// Several checkpoint files claim the same highest step
    #[error("Ambiguous resume: step {step} is encoded by {candidates:?}")]
    AmbiguousResume { step: u64, candidates: Vec<String> },

    /// A shard failed to decode; there is no retry
    #[error("Data loading error at '{path}': {message}")]
    DataLoading { message: String, path: String },

    /// Errors from the Candle tensor library
    #[error("Candle error: {0}")]
    Candle(String),

    /// I/O errors with path context
    #[error("IO error at '{path}': {message}")]
    Io { message: String, path: String },

    /// Transport failure inside a collective operation
    #[error("Collective error on rank {rank}: {message}")]
    Collective { rank: usize, message: String },

    /// The prefetch worker died or its channel closed
    #[error("Worker panic: {0}")]
    WorkerPanic(String),

    /// A shard was submitted while another load was still outstanding
    #[error("Prefetch busy: '{pending}' has not been collected")]
    PrefetchBusy { pending: String },

    /// JSON encode/decode failures outside checkpoint loading
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for orchestration
pub type JobResult<T> = std::result::Result<T, JobError>;

impl JobError {
    /// True for errors raised before any step runs (bad inputs, bad resume state)
    pub fn is_startup_error(&self) -> bool {
        matches!(
            self,
            JobError::Configuration(_)
                | JobError::CheckpointCorrupt { .. }
                | JobError::AmbiguousResume { .. }
        )
    }

    /// Get the path associated with this error (if any)
    pub fn path(&self) -> Option<&str> {
        match self {
            JobError::CheckpointCorrupt { path, .. } => Some(path),
            JobError::DataLoading { path, .. } => Some(path),
            JobError::Io { path, .. } => Some(path),
            _ => None,
        }
    }
}

impl From<candle_core::Error> for JobError {
    fn from(err: candle_core::Error) -> Self {
        JobError::Candle(err.to_string())
    }
}

impl From<std::io::Error> for JobError {
    fn from(err: std::io::Error) -> Self {
        JobError::Io {
            message: err.to_string(),
            path: String::new(),
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::Serialization(err.to_string())
    }
}

/// Helper trait for adding path context to IO operations
pub trait IoResultExt<T> {
    fn with_path<P: AsRef<Path>>(self, path: P) -> JobResult<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path<P: AsRef<Path>>(self, path: P) -> JobResult<T> {
        self.map_err(|e| JobError::Io {
            message: e.to_string(),
            path: path.as_ref().display().to_string(),
        })
    }
}

/// Helper for creating config errors
pub fn config_error(message: impl Into<String>) -> JobError {
    JobError::Configuration(message.into())
}

/// Helper for creating corrupt-checkpoint errors
pub fn corrupt_checkpoint<P: AsRef<Path>>(message: impl Into<String>, path: P) -> JobError {
    JobError::CheckpointCorrupt {
        message: message.into(),
        path: path.as_ref().display().to_string(),
    }
}

/// Helper for creating shard decode errors
pub fn data_error<P: AsRef<Path>>(message: impl Into<String>, path: P) -> JobError {
    JobError::DataLoading {
        message: message.into(),
        path: path.as_ref().display().to_string(),
    }
}
