//! # Design
//!
//! - Keep error messages constant; store operational context in fields.
//! - Admission and state-machine errors return synchronously to the caller.
//! - Background faults never surface here; workers log them instead.

use std::error::Error;
use std::path::PathBuf;

use kestrel_config::ConfigError;
use kestrel_torrent_core::{TaskId, TaskKind, TorrentError};
use thiserror::Error;

/// Errors returned by [`crate::Engine`] operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The identity is already tracked (active or queued).
    #[error("task already exists")]
    AlreadyExists {
        /// Duplicate identity.
        task_id: TaskId,
    },
    /// No queued task is waiting for admission.
    #[error("wait list empty")]
    WaitListEmpty,
    /// The concurrency limit is reached; the task was queued instead.
    #[error("maximum concurrent tasks reached")]
    MaxConcurrentReached {
        /// Queued identity.
        task_id: TaskId,
        /// Zero-based position in the wait list.
        position: usize,
    },
    /// Start requested on a task or file that is already started.
    #[error("already started")]
    AlreadyStarted {
        /// Task identity.
        task_id: TaskId,
        /// File path when the request targeted a single file.
        path: Option<String>,
    },
    /// Stop requested on a task or file that is already stopped.
    #[error("already stopped")]
    AlreadyStopped {
        /// Task identity.
        task_id: TaskId,
        /// File path when the request targeted a single file.
        path: Option<String>,
    },
    /// The task has no file at the requested path.
    #[error("missing file")]
    MissingFile {
        /// Task identity.
        task_id: TaskId,
        /// Requested path.
        path: String,
    },
    /// No task with this identity is tracked.
    #[error("task not found")]
    TaskNotFound {
        /// Requested identity.
        task_id: TaskId,
    },
    /// The engine has no protocol engine yet.
    #[error("engine not configured")]
    NotConfigured,
    /// The supplied configuration was rejected.
    #[error("invalid engine configuration")]
    InvalidConfig(#[from] ConfigError),
    /// Every protocol engine construction attempt failed.
    #[error("protocol engine construction failed")]
    EngineConstructionFailed {
        /// Attempts made before giving up.
        attempts: u32,
        /// Failure reported by the final attempt.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// The descriptor could not be parsed.
    #[error("malformed descriptor")]
    MalformedDescriptor {
        /// Descriptor kind that was submitted.
        kind: TaskKind,
        /// Parser failure or panic message.
        reason: String,
    },
    /// The protocol engine rejected an operation.
    #[error(transparent)]
    Protocol(#[from] TorrentError),
    /// A resume cache operation failed.
    #[error("resume cache IO failure")]
    Io {
        /// Operation that triggered the failure.
        operation: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Identity the error concerns, when it concerns a single task.
    #[must_use]
    pub const fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::AlreadyExists { task_id }
            | Self::MaxConcurrentReached { task_id, .. }
            | Self::AlreadyStarted { task_id, .. }
            | Self::AlreadyStopped { task_id, .. }
            | Self::MissingFile { task_id, .. }
            | Self::TaskNotFound { task_id } => Some(task_id),
            _ => None,
        }
    }
}

/// Convenience alias for engine results.
pub type EngineResult<T> = Result<T, EngineError>;
